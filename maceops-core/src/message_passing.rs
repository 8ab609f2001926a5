//! Invariant tensor-product message passing.
//!
//! For every node `n`, degree-indexed component `m` and channel `c`:
//!
//! ```text
//! out[n, m, c] = sum over edges i with receiver[i] = n of
//!                X[i, c] * Y[i, m] * R[i, degree(m), c]
//! ```
//!
//! The forward pass is a segmented reduction over the sorted receiver.
//! Gradients with respect to the edge tensors are edge-local. When the
//! features are per node and broadcast along the sender, the feature
//! gradient is reduced back per sender through a [`NeighbourIndex`].

use std::sync::Arc;

use rayon::ThreadPool;
use tracing::{debug, trace};

use crate::{
    config::KernelConfig,
    irreps::DegreeLayout,
    neighbours::NeighbourIndex,
    reduce::bucket_sum,
    storage::TensorProductProblem,
    tensor::same_device,
    DType, Error, Graph, Result, Tensor,
};

/// Gradients of the edge-feature contract.
#[derive(Clone, Debug)]
pub struct EdgeGradients<T: DType> {
    /// `[E, C]`
    pub edge_feature: Tensor<T>,
    /// `[E, M]`
    pub edge_harmonic: Tensor<T>,
    /// `[E, lmax + 1, C]`
    pub edge_radial: Tensor<T>,
}

/// Gradients of the node-feature contract.
#[derive(Clone, Debug)]
pub struct NodeGradients<T: DType> {
    /// `[N, C]`
    pub node_feature: Tensor<T>,
    pub edge_harmonic: Tensor<T>,
    pub edge_radial: Tensor<T>,
}

#[derive(Clone, Debug)]
pub struct InvariantMessagePassing {
    layout: DegreeLayout,
    channels: usize,
    config: KernelConfig,
    pool: Arc<ThreadPool>,
}

impl InvariantMessagePassing {
    pub fn new(layout: DegreeLayout, channels: usize) -> Result<Self> {
        Self::with_config(layout, channels, KernelConfig::default())
    }

    pub fn with_config(layout: DegreeLayout, channels: usize, config: KernelConfig) -> Result<Self> {
        if channels == 0 {
            return Err(Error::unsupported("message passing needs at least one channel"));
        }
        let pool = config.build_pool()?;
        debug!(
            lmax = layout.lmax(),
            channels,
            threads = config.num_threads,
            "built invariant message passing"
        );
        Ok(Self {
            layout,
            channels,
            config,
            pool,
        })
    }

    pub fn layout(&self) -> &DegreeLayout {
        &self.layout
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Sender-grouped index of `graph` with this layer's bucket capacity,
    /// as consumed by [`Self::backward_nodes`].
    pub fn sender_index(&self, graph: &Graph) -> Result<NeighbourIndex> {
        graph.sender_index(self.config.bucket_capacity)
    }

    /// Check every operand against the graph and the layer before any work.
    fn problem<'a, T: DType>(
        &'a self,
        op: &'static str,
        graph: &'a Graph,
        edge_harmonic: &Tensor<T>,
        edge_radial: &Tensor<T>,
    ) -> Result<TensorProductProblem<'a>> {
        let (e, m, c, l) = (
            graph.nedges(),
            self.layout.num_components(),
            self.channels,
            self.layout.num_degrees(),
        );
        edge_harmonic.expect_dims(op, &[e, m])?;
        edge_radial.expect_dims(op, &[e, l, c])?;
        Ok(TensorProductProblem {
            receiver: graph.receiver(),
            row_offsets: graph.row_offsets(),
            lm_to_degree: self.layout.lm_to_degree(),
            nnodes: graph.nnodes(),
            nedges: e,
            num_lm: m,
            num_degrees: l,
            channels: c,
            min_rows_per_task: self.config.min_rows_per_task,
        })
    }

    /// `edge_feature[E, C]`, `edge_harmonic[E, M]`, `edge_radial[E, lmax + 1, C]`
    /// to node messages `[N, M, C]`.
    pub fn forward<T: DType>(
        &self,
        edge_feature: &Tensor<T>,
        edge_harmonic: &Tensor<T>,
        edge_radial: &Tensor<T>,
        graph: &Graph,
    ) -> Result<Tensor<T>> {
        const OP: &str = "InvariantMessagePassing::forward";
        let p = self.problem(OP, graph, edge_harmonic, edge_radial)?;
        edge_feature.expect_dims(OP, &[p.nedges, p.channels])?;
        let device = same_device(OP, &[edge_feature, edge_harmonic, edge_radial])?;
        trace!(nnodes = p.nnodes, nedges = p.nedges, ?device, "tensor product forward");

        let storage = self.pool.install(|| {
            device.tensor_product_forward(
                &p,
                edge_feature.storage(),
                edge_harmonic.storage(),
                edge_radial.storage(),
            )
        })?;
        Ok(Tensor::from_storage(storage, (p.nnodes, p.num_lm, p.channels)))
    }

    /// Exact gradients of [`Self::forward`] given `grad_output[N, M, C]`.
    pub fn backward<T: DType>(
        &self,
        edge_feature: &Tensor<T>,
        edge_harmonic: &Tensor<T>,
        edge_radial: &Tensor<T>,
        graph: &Graph,
        grad_output: &Tensor<T>,
    ) -> Result<EdgeGradients<T>> {
        const OP: &str = "InvariantMessagePassing::backward";
        let p = self.problem(OP, graph, edge_harmonic, edge_radial)?;
        edge_feature.expect_dims(OP, &[p.nedges, p.channels])?;
        grad_output.expect_dims(OP, &[p.nnodes, p.num_lm, p.channels])?;
        let device = same_device(OP, &[edge_feature, edge_harmonic, edge_radial, grad_output])?;
        trace!(nnodes = p.nnodes, nedges = p.nedges, ?device, "tensor product backward");

        let grads = self.pool.install(|| {
            device.tensor_product_backward(
                &p,
                edge_feature.storage(),
                edge_harmonic.storage(),
                edge_radial.storage(),
                grad_output.storage(),
            )
        })?;
        Ok(EdgeGradients {
            edge_feature: Tensor::from_storage(grads.feature, (p.nedges, p.channels)),
            edge_harmonic: Tensor::from_storage(grads.harmonic, (p.nedges, p.num_lm)),
            edge_radial: Tensor::from_storage(
                grads.radial,
                (p.nedges, p.num_degrees, p.channels),
            ),
        })
    }

    /// Broadcast `node_feature[N, C]` onto the edges by sender and run
    /// [`Self::forward`].
    pub fn forward_nodes<T: DType>(
        &self,
        node_feature: &Tensor<T>,
        edge_harmonic: &Tensor<T>,
        edge_radial: &Tensor<T>,
        graph: &Graph,
    ) -> Result<Tensor<T>> {
        self.problem("InvariantMessagePassing::forward_nodes", graph, edge_harmonic, edge_radial)?;
        let edge_feature = self.gather_by_sender(node_feature, graph)?;
        self.forward(&edge_feature, edge_harmonic, edge_radial, graph)
    }

    /// Gradients of [`Self::forward_nodes`]. The feature gradient is summed
    /// per sender through `sender_index`, bucket by bucket, with a fixed
    /// combine order, so it does not depend on thread scheduling.
    pub fn backward_nodes<T: DType>(
        &self,
        node_feature: &Tensor<T>,
        edge_harmonic: &Tensor<T>,
        edge_radial: &Tensor<T>,
        graph: &Graph,
        sender_index: &NeighbourIndex,
        grad_output: &Tensor<T>,
    ) -> Result<NodeGradients<T>> {
        const OP: &str = "InvariantMessagePassing::backward_nodes";
        if sender_index.nnodes() != graph.nnodes() || sender_index.nedges() != graph.nedges() {
            return Err(Error::shape_mismatch(
                OP,
                &[graph.nnodes(), graph.nedges()],
                &[sender_index.nnodes(), sender_index.nedges()],
            ));
        }
        let sender = graph.sender();
        for b in 0..sender_index.num_buckets() {
            let node = sender_index.bucket_node(b) as u32;
            if let Some(&edge) = sender_index.bucket(b).iter().find(|&&i| sender[i as usize] != node) {
                return Err(Error::invalid_graph(format!(
                    "sender index lists edge {edge} under node {node}, but its sender is {}",
                    sender[edge as usize]
                )));
            }
        }
        let problem = self.problem(OP, graph, edge_harmonic, edge_radial)?;
        grad_output.expect_dims(OP, &[problem.nnodes, problem.num_lm, problem.channels])?;

        let edge_feature = self.gather_by_sender(node_feature, graph)?;
        let edge = self.backward(&edge_feature, edge_harmonic, edge_radial, graph, grad_output)?;

        let device = edge.edge_feature.device();
        let per_edge = edge.edge_feature.data()?;
        let summed = self
            .pool
            .install(|| bucket_sum(sender_index, &per_edge, self.channels));
        let node_feature = Tensor::from_vec(summed, (graph.nnodes(), self.channels), &device)?;

        Ok(NodeGradients {
            node_feature,
            edge_harmonic: edge.edge_harmonic,
            edge_radial: edge.edge_radial,
        })
    }

    fn gather_by_sender<T: DType>(&self, node_feature: &Tensor<T>, graph: &Graph) -> Result<Tensor<T>> {
        node_feature.expect_dims("InvariantMessagePassing::gather", &[graph.nnodes(), self.channels])?;
        let device = node_feature.device();
        let storage = self.pool.install(|| {
            device.gather_rows(node_feature.storage(), graph.sender(), self.channels)
        })?;
        Ok(Tensor::from_storage(storage, (graph.nedges(), self.channels)))
    }
}
