use tracing::debug;

use crate::{neighbours::NeighbourIndex, Error, Result};

/// A static directed graph with its edges sorted by receiver.
///
/// Validated once here; every kernel afterwards relies on the receiver
/// being sorted and all indices being in range. The CSR offsets of the
/// receiver segments are derived at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Graph {
    nnodes: usize,
    sender: Vec<u32>,
    receiver: Vec<u32>,
    row_offsets: Vec<u32>,
}

impl Graph {
    pub fn new(nnodes: usize, sender: Vec<u32>, receiver: Vec<u32>) -> Result<Self> {
        if sender.len() != receiver.len() {
            return Err(Error::invalid_graph(format!(
                "sender has {} entries but receiver has {}",
                sender.len(),
                receiver.len()
            )));
        }
        if nnodes > u32::MAX as usize || receiver.len() >= u32::MAX as usize {
            return Err(Error::unsupported(format!(
                "graph with {nnodes} nodes and {} edges does not fit 32-bit indices",
                receiver.len()
            )));
        }
        if let Some((i, s)) = sender.iter().enumerate().find(|(_, s)| **s as usize >= nnodes) {
            return Err(Error::invalid_graph(format!(
                "sender[{i}] = {s} is out of range for {nnodes} nodes"
            )));
        }

        let mut row_offsets = vec![0u32; nnodes + 1];
        for (i, &r) in receiver.iter().enumerate() {
            if r as usize >= nnodes {
                return Err(Error::invalid_graph(format!(
                    "receiver[{i}] = {r} is out of range for {nnodes} nodes"
                )));
            }
            if i > 0 && receiver[i - 1] > r {
                return Err(Error::invalid_graph(format!(
                    "receiver is not sorted: receiver[{}] = {} > receiver[{i}] = {r}",
                    i - 1,
                    receiver[i - 1]
                )));
            }
            row_offsets[r as usize + 1] += 1;
        }
        for n in 0..nnodes {
            row_offsets[n + 1] += row_offsets[n];
        }

        debug!(nnodes, nedges = receiver.len(), "validated graph");
        Ok(Self {
            nnodes,
            sender,
            receiver,
            row_offsets,
        })
    }

    /// Build from `(sender, receiver)` pairs, already ordered by receiver.
    pub fn from_edges(nnodes: usize, edges: &[(u32, u32)]) -> Result<Self> {
        let (sender, receiver) = edges.iter().copied().unzip();
        Self::new(nnodes, sender, receiver)
    }

    pub fn nnodes(&self) -> usize {
        self.nnodes
    }

    pub fn nedges(&self) -> usize {
        self.receiver.len()
    }

    pub fn sender(&self) -> &[u32] {
        &self.sender
    }

    pub fn receiver(&self) -> &[u32] {
        &self.receiver
    }

    /// `nnodes + 1` offsets; edges of node `n` are `row_offsets[n]..row_offsets[n + 1]`.
    pub fn row_offsets(&self) -> &[u32] {
        &self.row_offsets
    }

    pub fn in_degree(&self, node: usize) -> usize {
        (self.row_offsets[node + 1] - self.row_offsets[node]) as usize
    }

    pub fn receiver_index(&self, bucket_capacity: usize) -> Result<NeighbourIndex> {
        NeighbourIndex::build(&self.receiver, self.nnodes, bucket_capacity)
    }

    pub fn sender_index(&self, bucket_capacity: usize) -> Result<NeighbourIndex> {
        NeighbourIndex::group_by(&self.sender, self.nnodes, bucket_capacity)
    }
}
