//! Reduction drivers shared by the CPU kernels.
//!
//! Two flavours exist. [`segmented_rows`] walks the edges of a sorted
//! receiver in order and flushes a running accumulator whenever the
//! receiver changes; each worker owns a contiguous block of output rows, so
//! no row is ever written by two workers. [`bucket_sum`] reduces over a
//! [`NeighbourIndex`] instead: every bucket is summed on its own and the
//! bucket partials of a node are combined with a fixed pairwise tree.

use rayon::prelude::*;

use crate::{dtype::Accumulator, neighbours::NeighbourIndex, DType};

/// Fold the edge segments of a sorted receiver into output rows.
///
/// `out` holds `row_offsets.len() - 1` rows of `row_len` elements. `fold`
/// adds the contribution of one edge into the accumulator row. Rows without
/// edges are left as zero.
pub(crate) fn segmented_rows<T, F>(
    out: &mut [T],
    row_len: usize,
    receiver: &[u32],
    row_offsets: &[u32],
    rows_per_task: usize,
    fold: F,
) where
    T: DType,
    F: Fn(usize, &mut [T::Acc]) + Sync,
{
    if row_len == 0 || out.is_empty() {
        return;
    }
    let rows_per_task = rows_per_task.max(1);

    out.par_chunks_mut(rows_per_task * row_len)
        .enumerate()
        .for_each(|(block, chunk)| {
            let first = block * rows_per_task;
            let rows = chunk.len() / row_len;
            let start = row_offsets[first] as usize;
            let end = row_offsets[first + rows] as usize;

            let mut acc = vec![<T::Acc as Accumulator>::ZERO; row_len];
            let mut flush = |node: usize, acc: &mut [T::Acc]| {
                let local = node - first;
                let dst = &mut chunk[local * row_len..(local + 1) * row_len];
                for (d, a) in dst.iter_mut().zip(acc.iter_mut()) {
                    *d = T::from_acc(*a);
                    *a = <T::Acc as Accumulator>::ZERO;
                }
            };

            let mut current = None;
            for edge in start..end {
                let node = receiver[edge] as usize;
                if current != Some(node) {
                    if let Some(prev) = current {
                        flush(prev, &mut acc);
                    }
                    current = Some(node);
                }
                fold(edge, &mut acc);
            }
            if let Some(prev) = current {
                flush(prev, &mut acc);
            }
        });
}

/// Sum `values` (`[nedges, row_len]`) into `[nnodes, row_len]` through the
/// buckets of `index`.
pub(crate) fn bucket_sum<T: DType>(index: &NeighbourIndex, values: &[T], row_len: usize) -> Vec<T> {
    let mut out = vec![T::ZERO; index.nnodes() * row_len];
    if row_len == 0 {
        return out;
    }

    let mut partials = vec![<T::Acc as Accumulator>::ZERO; index.num_buckets() * row_len];
    partials
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(bucket, partial)| {
            for &edge in index.bucket(bucket) {
                let row = &values[edge as usize * row_len..(edge as usize + 1) * row_len];
                for (p, v) in partial.iter_mut().zip(row) {
                    *p += v.to_acc();
                }
            }
        });

    out.par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(node, dst)| {
            let buckets = index.buckets(node);
            let rows = &partials[buckets.start * row_len..buckets.end * row_len];
            let combined = pairwise_tree(rows, row_len);
            for (d, a) in dst.iter_mut().zip(combined) {
                *d = T::from_acc(a);
            }
        });
    out
}

/// Combine `rows` (a whole number of `row_len` rows) with a balanced
/// pairwise tree. The pairing only depends on the number of rows.
pub(crate) fn pairwise_tree<A: Accumulator>(rows: &[A], row_len: usize) -> Vec<A> {
    let count = rows.len() / row_len;
    match count {
        0 => vec![A::ZERO; row_len],
        1 => rows.to_vec(),
        _ => {
            let mut buf = rows.to_vec();
            let mut width = count;
            while width > 1 {
                let half = width.div_ceil(2);
                for k in 0..width / 2 {
                    let (lo, hi) = buf.split_at_mut((k + half) * row_len);
                    for (a, b) in lo[k * row_len..(k + 1) * row_len]
                        .iter_mut()
                        .zip(&hi[..row_len])
                    {
                        *a += *b;
                    }
                }
                width = half;
            }
            buf.truncate(row_len);
            buf
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairwise_tree_matches_serial_sum() {
        let rows: Vec<f64> = (0..7 * 3).map(|v| v as f64).collect();
        let combined = pairwise_tree(&rows, 3);
        for j in 0..3 {
            let expected: f64 = (0..7).map(|r| rows[r * 3 + j]).sum();
            assert_eq!(combined[j], expected);
        }
    }

    #[test]
    fn pairwise_tree_of_nothing_is_zero() {
        assert_eq!(pairwise_tree::<f32>(&[], 2), vec![0.0, 0.0]);
    }

    #[test]
    fn segmented_rows_skips_empty_nodes() {
        let receiver = [1u32, 1, 3];
        let row_offsets = [0u32, 0, 2, 2, 3];
        let mut out = vec![0f32; 4];
        segmented_rows::<f32, _>(&mut out, 1, &receiver, &row_offsets, 1, |edge, acc| {
            acc[0] += (edge + 1) as f32;
        });
        assert_eq!(out, vec![0.0, 3.0, 0.0, 3.0]);
    }
}
