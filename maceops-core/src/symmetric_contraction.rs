//! Symmetric self-contraction of degree-indexed node features.
//!
//! For a node of element `e`, each channel is contracted independently
//! against sparse coupling tensors `U_nu` (`nu` = 1, 2, 3) weighted by
//! per-element path weights. Evaluation follows a Horner scheme from the
//! highest order down:
//!
//! ```text
//! B2[i1, i2] = sum_{i3,k} U3[i1,i2,i3,k] w3[e,k] x[i3] + sum_k U2[i1,i2,k] w2[e,k]
//! B1[i1]     = sum_{i2} B2[i1,i2] x[i2]                + sum_k U1[i1,k] w1[e,k]
//! out        = sum_{i1} B1[i1] x[i1]
//! ```

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::{
    dtype::Accumulator, irreps::DegreeLayout, linear::check_elements, DType, Device, Error,
    Result, Tensor,
};

pub const MAX_CORRELATION: usize = 3;

/// Non-zero coefficient of a coupling tensor. Only the first `order`
/// entries of `lm` are meaningful.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CouplingEntry {
    pub lm: [u32; MAX_CORRELATION],
    pub path: u32,
    pub value: f64,
}

/// Sparse coupling tensor `U` of shape `[M; order] x [num_paths]`.
#[derive(Clone, Debug, PartialEq)]
pub struct CouplingTensor {
    order: usize,
    num_lm: usize,
    num_paths: usize,
    entries: Vec<CouplingEntry>,
}

fn check_order(order: usize) -> Result<()> {
    if !(1..=MAX_CORRELATION).contains(&order) {
        return Err(Error::unsupported(format!(
            "correlation order must be between 1 and {MAX_CORRELATION}, got {order}"
        )));
    }
    Ok(())
}

impl CouplingTensor {
    /// Keep the non-zero entries of a dense row-major `[M^order, num_paths]`
    /// array, in row-major order.
    pub fn from_dense(order: usize, num_lm: usize, num_paths: usize, data: &[f64]) -> Result<Self> {
        check_order(order)?;
        let rows = num_lm.pow(order as u32);
        if data.len() != rows * num_paths {
            return Err(Error::shape_mismatch(
                "CouplingTensor::from_dense",
                &[rows * num_paths],
                &[data.len()],
            ));
        }
        let mut entries = Vec::new();
        for (flat, &value) in data.iter().enumerate() {
            if value == 0.0 {
                continue;
            }
            let path = flat % num_paths;
            let mut row = flat / num_paths;
            let mut lm = [0u32; MAX_CORRELATION];
            for slot in lm[..order].iter_mut().rev() {
                *slot = (row % num_lm) as u32;
                row /= num_lm;
            }
            entries.push(CouplingEntry {
                lm,
                path: path as u32,
                value,
            });
        }
        Ok(Self {
            order,
            num_lm,
            num_paths,
            entries,
        })
    }

    pub fn from_entries(
        order: usize,
        num_lm: usize,
        num_paths: usize,
        entries: Vec<CouplingEntry>,
    ) -> Result<Self> {
        check_order(order)?;
        for (i, entry) in entries.iter().enumerate() {
            let lm_ok = entry.lm[..order].iter().all(|&lm| (lm as usize) < num_lm);
            if !lm_ok || entry.path as usize >= num_paths {
                return Err(Error::unsupported(format!(
                    "coupling entry {i} ({entry:?}) is outside [{num_lm}; {order}] x [{num_paths}]"
                )));
            }
        }
        Ok(Self {
            order,
            num_lm,
            num_paths,
            entries,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn num_lm(&self) -> usize {
        self.num_lm
    }

    pub fn num_paths(&self) -> usize {
        self.num_paths
    }

    pub fn entries(&self) -> &[CouplingEntry] {
        &self.entries
    }
}

/// One correlation order: its coupling tensor and the path weights
/// `[num_elements, num_paths, channels]`.
#[derive(Clone, Debug)]
pub struct ContractionWeights<T: DType> {
    pub coupling: CouplingTensor,
    pub weights: Tensor<T>,
}

#[derive(Clone, Debug)]
struct Stage<T: DType> {
    coupling: CouplingTensor,
    /// `[num_elements, num_paths, channels]`
    weights: Vec<T>,
}

impl<T: DType> Stage<T> {
    fn weight(&self, e: usize, path: usize, channels: usize) -> &[T] {
        let start = (e * self.coupling.num_paths + path) * channels;
        &self.weights[start..start + channels]
    }
}

/// Per-node scratch: `B2[M, M, C]` and `B1[M, C]`.
struct Scratch<A> {
    b2: Vec<A>,
    b1: Vec<A>,
}

#[derive(Clone, Debug)]
pub struct SymmetricContraction<T: DType> {
    layout: DegreeLayout,
    channels: usize,
    num_elements: usize,
    /// Entry `nu - 1` holds the order-`nu` stage.
    stages: Vec<Stage<T>>,
}

impl<T: DType> SymmetricContraction<T> {
    pub fn new(
        layout: DegreeLayout,
        channels: usize,
        num_elements: usize,
        orders: Vec<ContractionWeights<T>>,
    ) -> Result<Self> {
        if orders.is_empty() || orders.len() > MAX_CORRELATION {
            return Err(Error::unsupported(format!(
                "expected 1 to {MAX_CORRELATION} correlation orders, got {}",
                orders.len()
            )));
        }
        if channels == 0 || num_elements == 0 {
            return Err(Error::unsupported(
                "symmetric contraction needs at least one channel and one element",
            ));
        }
        let num_lm = layout.num_components();
        let mut stages = Vec::with_capacity(orders.len());
        for (i, ContractionWeights { coupling, weights }) in orders.into_iter().enumerate() {
            let nu = i + 1;
            if coupling.order != nu {
                return Err(Error::unsupported(format!(
                    "slot {i} must hold the order-{nu} coupling tensor, got order {}",
                    coupling.order
                )));
            }
            if coupling.num_lm != num_lm {
                return Err(Error::unsupported(format!(
                    "order-{nu} coupling tensor spans {} components but the layout has {num_lm}",
                    coupling.num_lm
                )));
            }
            weights.expect_dims(
                "SymmetricContraction::new",
                &[num_elements, coupling.num_paths, channels],
            )?;
            let weights = weights.cpu_data("SymmetricContraction::new")?.to_vec();
            stages.push(Stage { coupling, weights });
        }
        debug!(
            lmax = layout.lmax(),
            channels,
            num_elements,
            correlation = stages.len(),
            "built symmetric contraction"
        );
        Ok(Self {
            layout,
            channels,
            num_elements,
            stages,
        })
    }

    pub fn correlation(&self) -> usize {
        self.stages.len()
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn num_elements(&self) -> usize {
        self.num_elements
    }

    fn check_input(&self, op: &'static str, x: &Tensor<T>, element: &[u32]) -> Result<usize> {
        let (n, _, _) = x.shape().dims3(op)?;
        x.expect_dims(op, &[n, self.layout.num_components(), self.channels])?;
        check_elements(op, element, n, self.num_elements)?;
        Ok(n)
    }

    fn scratch(&self) -> Scratch<T::Acc> {
        let (m, c) = (self.layout.num_components(), self.channels);
        Scratch {
            b2: vec![<T::Acc as Accumulator>::ZERO; m * m * c],
            b1: vec![<T::Acc as Accumulator>::ZERO; m * c],
        }
    }

    /// Fill `B2` and `B1` for one node. `x` is the node's `[M, C]` block.
    fn horner(&self, x: &[T], e: usize, s: &mut Scratch<T::Acc>) {
        let (m, c) = (self.layout.num_components(), self.channels);
        let zero = <T::Acc as Accumulator>::ZERO;
        s.b2.fill(zero);
        s.b1.fill(zero);

        if let Some(stage) = self.stages.get(2) {
            for entry in stage.coupling.entries() {
                let [i1, i2, i3] = entry.lm.map(|v| v as usize);
                let u = <T::Acc as Accumulator>::from_f64(entry.value);
                let w = stage.weight(e, entry.path as usize, c);
                let xs = &x[i3 * c..(i3 + 1) * c];
                let dst = &mut s.b2[(i1 * m + i2) * c..(i1 * m + i2 + 1) * c];
                for ((d, &wc), &xc) in dst.iter_mut().zip(w).zip(xs) {
                    *d += u * wc.to_acc() * xc.to_acc();
                }
            }
        }
        if let Some(stage) = self.stages.get(1) {
            for entry in stage.coupling.entries() {
                let (i1, i2) = (entry.lm[0] as usize, entry.lm[1] as usize);
                let u = <T::Acc as Accumulator>::from_f64(entry.value);
                let w = stage.weight(e, entry.path as usize, c);
                let dst = &mut s.b2[(i1 * m + i2) * c..(i1 * m + i2 + 1) * c];
                for (d, &wc) in dst.iter_mut().zip(w) {
                    *d += u * wc.to_acc();
                }
            }
        }
        if self.stages.len() >= 2 {
            for i1 in 0..m {
                for i2 in 0..m {
                    let b2 = &s.b2[(i1 * m + i2) * c..(i1 * m + i2 + 1) * c];
                    let xs = &x[i2 * c..(i2 + 1) * c];
                    let dst = &mut s.b1[i1 * c..(i1 + 1) * c];
                    for ((d, &b), &xc) in dst.iter_mut().zip(b2).zip(xs) {
                        *d += b * xc.to_acc();
                    }
                }
            }
        }
        let stage = &self.stages[0];
        for entry in stage.coupling.entries() {
            let i1 = entry.lm[0] as usize;
            let u = <T::Acc as Accumulator>::from_f64(entry.value);
            let w = stage.weight(e, entry.path as usize, c);
            let dst = &mut s.b1[i1 * c..(i1 + 1) * c];
            for (d, &wc) in dst.iter_mut().zip(w) {
                *d += u * wc.to_acc();
            }
        }
    }

    /// `x[N, M, C]`, `element[N]` to `[N, C]`.
    pub fn forward(&self, x: &Tensor<T>, element: &[u32]) -> Result<Tensor<T>> {
        const OP: &str = "SymmetricContraction::forward";
        let n = self.check_input(OP, x, element)?;
        let (m, c) = (self.layout.num_components(), self.channels);
        trace!(nodes = n, "symmetric contraction forward");
        let data = x.cpu_data(OP)?;

        let mut out = vec![T::ZERO; n * c];
        out.par_chunks_mut(c)
            .zip(data.par_chunks(m * c))
            .zip(element.par_iter())
            .for_each_init(
                || self.scratch(),
                |s, ((dst, x), &e)| {
                    self.horner(x, e as usize, s);
                    let mut acc = vec![<T::Acc as Accumulator>::ZERO; c];
                    for i1 in 0..m {
                        let b1 = &s.b1[i1 * c..(i1 + 1) * c];
                        let xs = &x[i1 * c..(i1 + 1) * c];
                        for ((a, &b), &xc) in acc.iter_mut().zip(b1).zip(xs) {
                            *a += b * xc.to_acc();
                        }
                    }
                    for (d, a) in dst.iter_mut().zip(acc) {
                        *d = T::from_acc(a);
                    }
                },
            );
        Tensor::from_vec(out, (n, c), &Device::Cpu)
    }

    /// Gradient with respect to `x` given `grad_output[N, C]`:
    /// `g * (B1[j] + sum_i1 x[i1] B2[i1, j] + sum_{i1,i2} x[i1] x[i2] W3[i1, i2, j])`.
    pub fn backward(
        &self,
        x: &Tensor<T>,
        element: &[u32],
        grad_output: &Tensor<T>,
    ) -> Result<Tensor<T>> {
        const OP: &str = "SymmetricContraction::backward";
        let n = self.check_input(OP, x, element)?;
        grad_output.expect_dims(OP, &[n, self.channels])?;
        let (m, c) = (self.layout.num_components(), self.channels);
        trace!(nodes = n, "symmetric contraction backward");
        let data = x.cpu_data(OP)?;
        let grad = grad_output.cpu_data(OP)?;

        let mut out = vec![T::ZERO; n * m * c];
        out.par_chunks_mut(m * c)
            .zip(data.par_chunks(m * c))
            .zip(grad.par_chunks(c))
            .zip(element.par_iter())
            .for_each_init(
                || (self.scratch(), vec![<T::Acc as Accumulator>::ZERO; m * c]),
                |(s, acc), (((dst, x), g), &e)| {
                    let e = e as usize;
                    self.horner(x, e, s);
                    acc.copy_from_slice(&s.b1);

                    if self.stages.len() >= 2 {
                        for i1 in 0..m {
                            let xs = &x[i1 * c..(i1 + 1) * c];
                            for j in 0..m {
                                let b2 = &s.b2[(i1 * m + j) * c..(i1 * m + j + 1) * c];
                                let dst = &mut acc[j * c..(j + 1) * c];
                                for ((d, &b), &xc) in dst.iter_mut().zip(b2).zip(xs) {
                                    *d += xc.to_acc() * b;
                                }
                            }
                        }
                    }
                    if let Some(stage) = self.stages.get(2) {
                        for entry in stage.coupling.entries() {
                            let [i1, i2, j] = entry.lm.map(|v| v as usize);
                            let u = <T::Acc as Accumulator>::from_f64(entry.value);
                            let w = stage.weight(e, entry.path as usize, c);
                            let x1 = &x[i1 * c..(i1 + 1) * c];
                            let x2 = &x[i2 * c..(i2 + 1) * c];
                            let dst = &mut acc[j * c..(j + 1) * c];
                            for (ch, d) in dst.iter_mut().enumerate() {
                                *d += u * w[ch].to_acc() * x1[ch].to_acc() * x2[ch].to_acc();
                            }
                        }
                    }

                    for (j, row) in dst.chunks_mut(c).enumerate() {
                        for (ch, d) in row.iter_mut().enumerate() {
                            *d = T::from_acc(g[ch].to_acc() * acc[j * c + ch]);
                        }
                    }
                },
            );
        Tensor::from_vec(out, (n, m, c), &Device::Cpu)
    }
}
