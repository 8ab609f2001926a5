use tracing::{debug, trace};

use crate::{
    linear::{check_elements, ElementalLinear, Linear},
    message_passing::InvariantMessagePassing,
    DType, Device, Error, Graph, Result, Tensor,
};

/// linear_up, tensor product and message linear, shared by both blocks.
#[derive(Clone, Debug)]
struct MessageStack<T: DType> {
    linear_up: Linear<T>,
    tp: InvariantMessagePassing,
    linear: Linear<T>,
    avg_num_neighbors: f64,
}

impl<T: DType> MessageStack<T> {
    fn new(
        linear_up: Linear<T>,
        tp: InvariantMessagePassing,
        linear: Linear<T>,
        avg_num_neighbors: f64,
    ) -> Result<Self> {
        if linear_up.layout().lmax() != 0 {
            return Err(Error::unsupported(
                "linear_up mixes scalar node features and must have lmax = 0",
            ));
        }
        if linear_up.ch_out() != tp.channels() {
            return Err(Error::unsupported(format!(
                "linear_up produces {} channels but the tensor product expects {}",
                linear_up.ch_out(),
                tp.channels()
            )));
        }
        if linear.layout() != tp.layout() || linear.ch_in() != tp.channels() {
            return Err(Error::unsupported(
                "message linear does not match the tensor product layout",
            ));
        }
        if !(avg_num_neighbors > 0.0) {
            return Err(Error::unsupported(format!(
                "avg_num_neighbors must be positive, got {avg_num_neighbors}"
            )));
        }
        Ok(Self {
            linear_up,
            tp,
            linear,
            avg_num_neighbors,
        })
    }

    /// `linear(tp(linear_up(x))) / avg_num_neighbors`, shaped `[N, M, C_out]`.
    fn message(
        &self,
        node_feature: &Tensor<T>,
        n: usize,
        c: usize,
        edge_harmonic: &Tensor<T>,
        edge_radial: &Tensor<T>,
        graph: &Graph,
    ) -> Result<Tensor<T>> {
        let up = self.linear_up.forward(&node_feature.reshape((n, 1, c))?)?;
        let up = up.reshape((n, self.linear_up.ch_out()))?;
        let message = self.tp.forward_nodes(&up, edge_harmonic, edge_radial, graph)?;
        let message = self.linear.forward(&message)?;

        let inv = 1.0 / self.avg_num_neighbors;
        let scaled = message
            .data()?
            .iter()
            .map(|v| T::from_f64(v.to_f64() * inv))
            .collect();
        Tensor::from_vec(scaled, message.shape().clone(), &Device::Cpu)
    }
}

/// Invariant interaction block: scalar channel mixing of the node features,
/// tensor-product message passing, message mixing normalised by the average
/// neighbour count and an optional per-element linear on the messages.
#[derive(Clone, Debug)]
pub struct InvariantInteraction<T: DType> {
    stack: MessageStack<T>,
    skip: Option<ElementalLinear<T>>,
}

impl<T: DType> InvariantInteraction<T> {
    pub fn new(
        linear_up: Linear<T>,
        tp: InvariantMessagePassing,
        linear: Linear<T>,
        skip: Option<ElementalLinear<T>>,
        avg_num_neighbors: f64,
    ) -> Result<Self> {
        let stack = MessageStack::new(linear_up, tp, linear, avg_num_neighbors)?;
        if let Some(skip) = &skip {
            if skip.layout() != stack.linear.layout() || skip.ch_in() != stack.linear.ch_out() {
                return Err(Error::unsupported(
                    "skip linear does not match the message linear layout",
                ));
            }
        }
        debug!(
            lmax = stack.tp.layout().lmax(),
            channels = stack.tp.channels(),
            skip = skip.is_some(),
            avg_num_neighbors,
            "built invariant interaction"
        );
        Ok(Self { stack, skip })
    }

    pub fn avg_num_neighbors(&self) -> f64 {
        self.stack.avg_num_neighbors
    }

    /// `node_feature[N, C]` to messages `[N, M, C_out]`. `element` holds one
    /// entry per node whether or not a skip linear is configured.
    pub fn forward(
        &self,
        node_feature: &Tensor<T>,
        element: &[u32],
        edge_harmonic: &Tensor<T>,
        edge_radial: &Tensor<T>,
        graph: &Graph,
    ) -> Result<Tensor<T>> {
        const OP: &str = "InvariantInteraction::forward";
        let (n, c) = node_feature.shape().dims2(OP)?;
        match &self.skip {
            Some(skip) => check_elements(OP, element, n, skip.num_elements())?,
            None if element.len() != n => {
                return Err(Error::shape_mismatch(OP, &[n], &[element.len()]))
            }
            None => {}
        }
        trace!(nodes = n, edges = graph.nedges(), "invariant interaction");

        let message = self
            .stack
            .message(node_feature, n, c, edge_harmonic, edge_radial, graph)?;
        match &self.skip {
            Some(skip) => skip.forward(&message, element),
            None => Ok(message),
        }
    }
}

/// Residual variant: the per-element skip acts on the incoming scalar node
/// features and is returned next to the unmixed message.
#[derive(Clone, Debug)]
pub struct InvariantResidualInteraction<T: DType> {
    stack: MessageStack<T>,
    skip: ElementalLinear<T>,
}

impl<T: DType> InvariantResidualInteraction<T> {
    pub fn new(
        linear_up: Linear<T>,
        tp: InvariantMessagePassing,
        linear: Linear<T>,
        skip: ElementalLinear<T>,
        avg_num_neighbors: f64,
    ) -> Result<Self> {
        let stack = MessageStack::new(linear_up, tp, linear, avg_num_neighbors)?;
        if skip.layout().lmax() != 0 || skip.ch_in() != stack.linear_up.ch_in() {
            return Err(Error::unsupported(
                "residual skip must map the scalar node features (lmax = 0, linear_up input channels)",
            ));
        }
        debug!(
            lmax = stack.tp.layout().lmax(),
            channels = stack.tp.channels(),
            sc_channels = skip.ch_out(),
            avg_num_neighbors,
            "built residual invariant interaction"
        );
        Ok(Self { stack, skip })
    }

    pub fn avg_num_neighbors(&self) -> f64 {
        self.stack.avg_num_neighbors
    }

    /// `node_feature[N, C]` to `(message[N, M, C_out], sc[N, C_sc])`.
    pub fn forward(
        &self,
        node_feature: &Tensor<T>,
        element: &[u32],
        edge_harmonic: &Tensor<T>,
        edge_radial: &Tensor<T>,
        graph: &Graph,
    ) -> Result<(Tensor<T>, Tensor<T>)> {
        const OP: &str = "InvariantResidualInteraction::forward";
        let (n, c) = node_feature.shape().dims2(OP)?;
        check_elements(OP, element, n, self.skip.num_elements())?;
        trace!(nodes = n, edges = graph.nedges(), "residual invariant interaction");

        let sc = self.skip.forward(&node_feature.reshape((n, 1, c))?, element)?;
        let sc = sc.reshape((n, self.skip.ch_out()))?;
        let message = self
            .stack
            .message(node_feature, n, c, edge_harmonic, edge_radial, graph)?;
        Ok((message, sc))
    }
}
