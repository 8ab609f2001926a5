use std::ops::Range;

use tracing::debug;

use crate::{Error, Result};

/// Slot value of an unused bucket entry.
pub const PAD: u32 = u32::MAX;

/// Per-node lists of edge ids, chopped into fixed-capacity buckets.
///
/// A node with more incoming edges than one bucket holds spills into
/// several consecutive buckets; a node with no edges owns no bucket. Each
/// bucket records its owning node and how many of its slots are filled.
/// Within a node, edge ids are listed in increasing order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighbourIndex {
    nnodes: usize,
    nedges: usize,
    bucket_capacity: usize,
    counts: Vec<u32>,
    node_buckets: Vec<u32>,
    slots: Vec<u32>,
    bucket_node: Vec<u32>,
    bucket_fill: Vec<u32>,
}

fn check_extents(nnodes: usize, nedges: usize, bucket_capacity: usize) -> Result<()> {
    if bucket_capacity == 0 {
        return Err(Error::unsupported("bucket capacity must be at least 1"));
    }
    if nnodes > u32::MAX as usize || nedges >= u32::MAX as usize {
        return Err(Error::unsupported(format!(
            "graph with {nnodes} nodes and {nedges} edges does not fit 32-bit indices"
        )));
    }
    Ok(())
}

impl NeighbourIndex {
    /// Index the edges of a receiver array sorted in non-decreasing order.
    pub fn build(receiver: &[u32], nnodes: usize, bucket_capacity: usize) -> Result<Self> {
        check_extents(nnodes, receiver.len(), bucket_capacity)?;
        let mut counts = vec![0u32; nnodes];
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
            counts[r as usize] += 1;
        }
        let order = (0..receiver.len() as u32).collect();
        Ok(Self::from_grouped(order, counts, bucket_capacity))
    }

    /// Index the edges of an arbitrary key array, e.g. the sender.
    ///
    /// Edges are grouped with a stable counting sort, so every node lists its
    /// edges in increasing id order.
    pub fn group_by(keys: &[u32], nnodes: usize, bucket_capacity: usize) -> Result<Self> {
        check_extents(nnodes, keys.len(), bucket_capacity)?;
        let mut counts = vec![0u32; nnodes];
        for (i, &k) in keys.iter().enumerate() {
            if k as usize >= nnodes {
                return Err(Error::invalid_graph(format!(
                    "key[{i}] = {k} is out of range for {nnodes} nodes"
                )));
            }
            counts[k as usize] += 1;
        }

        let mut cursor = Vec::with_capacity(nnodes);
        let mut running = 0u32;
        for &c in &counts {
            cursor.push(running);
            running += c;
        }
        let mut order = vec![0u32; keys.len()];
        for (edge, &k) in keys.iter().enumerate() {
            let slot = &mut cursor[k as usize];
            order[*slot as usize] = edge as u32;
            *slot += 1;
        }
        Ok(Self::from_grouped(order, counts, bucket_capacity))
    }

    /// `order` lists all edge ids grouped by node, nodes ascending.
    fn from_grouped(order: Vec<u32>, counts: Vec<u32>, bucket_capacity: usize) -> Self {
        let nnodes = counts.len();
        let nedges = order.len();

        let mut node_buckets = Vec::with_capacity(nnodes + 1);
        node_buckets.push(0u32);
        let mut num_buckets = 0usize;
        for &c in &counts {
            num_buckets += (c as usize).div_ceil(bucket_capacity);
            node_buckets.push(num_buckets as u32);
        }

        let mut slots = vec![PAD; num_buckets * bucket_capacity];
        let mut bucket_node = Vec::with_capacity(num_buckets);
        let mut bucket_fill = Vec::with_capacity(num_buckets);
        let mut start = 0usize;
        for (node, &c) in counts.iter().enumerate() {
            let edges = &order[start..start + c as usize];
            let first_bucket = node_buckets[node] as usize;
            for (k, chunk) in edges.chunks(bucket_capacity).enumerate() {
                let b = first_bucket + k;
                slots[b * bucket_capacity..b * bucket_capacity + chunk.len()].copy_from_slice(chunk);
                bucket_node.push(node as u32);
                bucket_fill.push(chunk.len() as u32);
            }
            start += c as usize;
        }

        debug!(
            nnodes,
            nedges, bucket_capacity, num_buckets, "built neighbour index"
        );
        Self {
            nnodes,
            nedges,
            bucket_capacity,
            counts,
            node_buckets,
            slots,
            bucket_node,
            bucket_fill,
        }
    }

    pub fn nnodes(&self) -> usize {
        self.nnodes
    }

    pub fn nedges(&self) -> usize {
        self.nedges
    }

    pub fn bucket_capacity(&self) -> usize {
        self.bucket_capacity
    }

    pub fn num_buckets(&self) -> usize {
        self.bucket_node.len()
    }

    /// Number of edges indexed under `node`.
    pub fn count(&self, node: usize) -> usize {
        self.counts[node] as usize
    }

    /// Ids of the buckets owned by `node`.
    pub fn buckets(&self, node: usize) -> Range<usize> {
        self.node_buckets[node] as usize..self.node_buckets[node + 1] as usize
    }

    /// Filled part of bucket `b`.
    pub fn bucket(&self, b: usize) -> &[u32] {
        let start = b * self.bucket_capacity;
        &self.slots[start..start + self.bucket_fill[b] as usize]
    }

    /// All slots of bucket `b`, unused ones set to [`PAD`].
    pub fn padded_bucket(&self, b: usize) -> &[u32] {
        let start = b * self.bucket_capacity;
        &self.slots[start..start + self.bucket_capacity]
    }

    pub fn bucket_node(&self, b: usize) -> usize {
        self.bucket_node[b] as usize
    }

    pub fn edges(&self, node: usize) -> impl Iterator<Item = u32> + '_ {
        self.buckets(node)
            .flat_map(move |b| self.bucket(b).iter().copied())
    }
}
