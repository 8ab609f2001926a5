//! Block-diagonal channel mixing on degree-indexed features.
//!
//! Every degree `L` that has an instruction owns one `[ch_in, ch_out]`
//! matrix; all `2L + 1` components of that degree are multiplied by it and
//! scaled by the instruction's path weight. Components never mix across
//! degrees, and degrees without an instruction come out as zero.

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::{irreps::DegreeLayout, DType, Device, Error, Result, Tensor};

/// One weight block of a [`Linear`] or [`ElementalLinear`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearInstruction {
    pub degree: usize,
    pub path_weight: f64,
}

impl LinearInstruction {
    pub fn new(degree: usize, path_weight: f64) -> Self {
        Self {
            degree,
            path_weight,
        }
    }

    /// Block with the default `1 / sqrt(ch_in)` normalisation.
    pub fn normalized(degree: usize, ch_in: usize) -> Self {
        Self::new(degree, 1.0 / (ch_in as f64).sqrt())
    }
}

#[derive(Clone, Copy, Debug)]
enum Direction {
    /// `x @ W`
    Forward,
    /// `g @ W^T`
    Backward,
}

#[derive(Clone, Copy, Debug)]
struct Block {
    /// Offset of the block's matrix inside one weight set.
    offset: usize,
    path_weight: f64,
}

/// Validated instruction list, indexed by degree.
#[derive(Clone, Debug)]
struct BlockPlan {
    layout: DegreeLayout,
    ch_in: usize,
    ch_out: usize,
    blocks: Vec<Option<Block>>,
    num_instructions: usize,
}

impl BlockPlan {
    fn new(
        layout: DegreeLayout,
        ch_in: usize,
        ch_out: usize,
        instructions: &[LinearInstruction],
    ) -> Result<Self> {
        if ch_in == 0 || ch_out == 0 {
            return Err(Error::unsupported(format!(
                "linear layers need at least one channel, got {ch_in} -> {ch_out}"
            )));
        }
        let mut blocks = vec![None; layout.num_degrees()];
        for (i, ins) in instructions.iter().enumerate() {
            let slot = blocks.get_mut(ins.degree).ok_or_else(|| {
                Error::unsupported(format!(
                    "instruction {i} targets degree {} but lmax is {}",
                    ins.degree,
                    layout.lmax()
                ))
            })?;
            if slot.is_some() {
                return Err(Error::unsupported(format!(
                    "degree {} has more than one instruction",
                    ins.degree
                )));
            }
            *slot = Some(Block {
                offset: i * ch_in * ch_out,
                path_weight: ins.path_weight,
            });
        }
        Ok(Self {
            layout,
            ch_in,
            ch_out,
            blocks,
            num_instructions: instructions.len(),
        })
    }

    /// Weights in one set: every instruction's `[ch_in, ch_out]` matrix.
    fn set_len(&self) -> usize {
        self.num_instructions * self.ch_in * self.ch_out
    }

    fn channels(&self, dir: Direction) -> (usize, usize) {
        match dir {
            Direction::Forward => (self.ch_in, self.ch_out),
            Direction::Backward => (self.ch_out, self.ch_in),
        }
    }

    /// Row/column strides of `W` (forward) or `W^T` (backward).
    fn rhs_stride(&self, dir: Direction) -> [usize; 2] {
        match dir {
            Direction::Forward => [self.ch_out, 1],
            Direction::Backward => [1, self.ch_out],
        }
    }

    fn check_input<T: DType>(
        &self,
        op: &'static str,
        x: &Tensor<T>,
        channels: usize,
    ) -> Result<usize> {
        let (n, m, c) = x.shape().dims3(op)?;
        let expected = [n, self.layout.num_components(), channels];
        if [n, m, c] != expected {
            return Err(Error::shape_mismatch(op, &expected, x.dims()));
        }
        Ok(n)
    }

    /// `dst[n, j, :] = pw * src[n, j, :] @ W` for all `count` nodes at once,
    /// one strided gemm per component.
    fn apply_strided<T: DType>(
        &self,
        src: &[T],
        dst: &mut [T],
        count: usize,
        weights: &[T],
        dir: Direction,
    ) {
        if count == 0 {
            return;
        }
        let m = self.layout.num_components();
        let (src_ch, dst_ch) = self.channels(dir);
        for (l, block) in self.blocks.iter().enumerate() {
            let Some(block) = block else { continue };
            let w = &weights[block.offset..block.offset + self.ch_in * self.ch_out];
            for j in self.layout.degree_range(l) {
                T::launch_gemm(
                    &src[j * src_ch..],
                    [m * src_ch, 1],
                    w,
                    self.rhs_stride(dir),
                    count,
                    dst_ch,
                    src_ch,
                    &mut dst[j * dst_ch..],
                    [m * dst_ch, 1],
                    T::ZERO,
                    T::from_f64(block.path_weight),
                    true,
                );
            }
        }
    }

    /// Same product for a single node: one gemm per degree over its
    /// `2L + 1` contiguous rows.
    fn apply_node<T: DType>(&self, src: &[T], dst: &mut [T], weights: &[T], dir: Direction) {
        let (src_ch, dst_ch) = self.channels(dir);
        for (l, block) in self.blocks.iter().enumerate() {
            let Some(block) = block else { continue };
            let w = &weights[block.offset..block.offset + self.ch_in * self.ch_out];
            let rows = self.layout.degree_range(l);
            T::launch_gemm(
                &src[rows.start * src_ch..],
                [src_ch, 1],
                w,
                self.rhs_stride(dir),
                rows.len(),
                dst_ch,
                src_ch,
                &mut dst[rows.start * dst_ch..],
                [dst_ch, 1],
                T::ZERO,
                T::from_f64(block.path_weight),
                false,
            );
        }
    }
}

/// Degree-block linear layer shared by all nodes.
#[derive(Clone, Debug)]
pub struct Linear<T: DType> {
    plan: BlockPlan,
    weights: Vec<T>,
}

impl<T: DType> Linear<T> {
    /// `weights` holds the instructions' `[ch_in, ch_out]` matrices
    /// flattened back to back, `[instructions.len() * ch_in * ch_out]`.
    pub fn new(
        layout: DegreeLayout,
        ch_in: usize,
        ch_out: usize,
        instructions: Vec<LinearInstruction>,
        weights: &Tensor<T>,
    ) -> Result<Self> {
        let plan = BlockPlan::new(layout, ch_in, ch_out, &instructions)?;
        weights.expect_dims("Linear::new", &[plan.set_len()])?;
        let weights = weights.cpu_data("Linear::new")?.to_vec();
        debug!(
            lmax = plan.layout.lmax(),
            ch_in,
            ch_out,
            blocks = instructions.len(),
            "built linear layer"
        );
        Ok(Self { plan, weights })
    }

    /// One block per degree with the default path weight, from
    /// `weights[lmax + 1, ch_in, ch_out]`.
    pub fn dense(layout: DegreeLayout, ch_in: usize, ch_out: usize, weights: &Tensor<T>) -> Result<Self> {
        let degrees = layout.num_degrees();
        weights.expect_dims("Linear::dense", &[degrees, ch_in, ch_out])?;
        let instructions = (0..degrees)
            .map(|l| LinearInstruction::normalized(l, ch_in))
            .collect();
        Self::new(
            layout,
            ch_in,
            ch_out,
            instructions,
            &weights.reshape(degrees * ch_in * ch_out)?,
        )
    }

    pub fn layout(&self) -> &DegreeLayout {
        &self.plan.layout
    }

    pub fn ch_in(&self) -> usize {
        self.plan.ch_in
    }

    pub fn ch_out(&self) -> usize {
        self.plan.ch_out
    }

    /// `x[N, M, ch_in] -> [N, M, ch_out]`
    pub fn forward(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        self.run("Linear::forward", x, Direction::Forward)
    }

    /// `grad_output[N, M, ch_out] -> grad_x[N, M, ch_in]`
    pub fn backward(&self, grad_output: &Tensor<T>) -> Result<Tensor<T>> {
        self.run("Linear::backward", grad_output, Direction::Backward)
    }

    fn run(&self, op: &'static str, src: &Tensor<T>, dir: Direction) -> Result<Tensor<T>> {
        let (src_ch, dst_ch) = self.plan.channels(dir);
        let n = self.plan.check_input(op, src, src_ch)?;
        let m = self.plan.layout.num_components();
        trace!(op, nodes = n, "linear");
        let data = src.cpu_data(op)?;
        let mut out = vec![T::ZERO; n * m * dst_ch];
        self.plan.apply_strided(data, &mut out, n, &self.weights, dir);
        Tensor::from_vec(out, (n, m, dst_ch), &Device::Cpu)
    }
}

/// Degree-block linear layer with one weight set per chemical element.
#[derive(Clone, Debug)]
pub struct ElementalLinear<T: DType> {
    plan: BlockPlan,
    num_elements: usize,
    /// `[num_elements, set_len]`, already scaled by `1 / sqrt(num_elements)`.
    weights: Vec<T>,
}

impl<T: DType> ElementalLinear<T> {
    /// `weights` is `[num_elements, instructions.len() * ch_in * ch_out]`.
    pub fn new(
        layout: DegreeLayout,
        ch_in: usize,
        ch_out: usize,
        num_elements: usize,
        instructions: Vec<LinearInstruction>,
        weights: &Tensor<T>,
    ) -> Result<Self> {
        if num_elements == 0 {
            return Err(Error::unsupported("elemental linear needs at least one element"));
        }
        let plan = BlockPlan::new(layout, ch_in, ch_out, &instructions)?;
        weights.expect_dims("ElementalLinear::new", &[num_elements, plan.set_len()])?;
        let scale = 1.0 / (num_elements as f64).sqrt();
        let weights = weights
            .cpu_data("ElementalLinear::new")?
            .iter()
            .map(|w| T::from_f64(w.to_f64() * scale))
            .collect();
        debug!(
            lmax = plan.layout.lmax(),
            ch_in, ch_out, num_elements, "built elemental linear layer"
        );
        Ok(Self {
            plan,
            num_elements,
            weights,
        })
    }

    pub fn layout(&self) -> &DegreeLayout {
        &self.plan.layout
    }

    pub fn ch_in(&self) -> usize {
        self.plan.ch_in
    }

    pub fn ch_out(&self) -> usize {
        self.plan.ch_out
    }

    pub fn num_elements(&self) -> usize {
        self.num_elements
    }

    /// `x[N, M, ch_in]` with `element[N]` selecting each node's weight set.
    pub fn forward(&self, x: &Tensor<T>, element: &[u32]) -> Result<Tensor<T>> {
        self.run("ElementalLinear::forward", x, element, Direction::Forward)
    }

    pub fn backward(&self, grad_output: &Tensor<T>, element: &[u32]) -> Result<Tensor<T>> {
        self.run("ElementalLinear::backward", grad_output, element, Direction::Backward)
    }

    fn run(
        &self,
        op: &'static str,
        src: &Tensor<T>,
        element: &[u32],
        dir: Direction,
    ) -> Result<Tensor<T>> {
        let (src_ch, dst_ch) = self.plan.channels(dir);
        let n = self.plan.check_input(op, src, src_ch)?;
        check_elements(op, element, n, self.num_elements)?;
        let m = self.plan.layout.num_components();
        trace!(op, nodes = n, "elemental linear");

        let data = src.cpu_data(op)?;
        let set_len = self.plan.set_len();
        let mut out = vec![T::ZERO; n * m * dst_ch];
        out.par_chunks_mut(m * dst_ch)
            .zip(data.par_chunks(m * src_ch))
            .zip(element.par_iter())
            .for_each(|((dst, src), &e)| {
                let w = &self.weights[e as usize * set_len..(e as usize + 1) * set_len];
                self.plan.apply_node(src, dst, w, dir);
            });
        Tensor::from_vec(out, (n, m, dst_ch), &Device::Cpu)
    }
}

/// `element` must hold one in-range element index per node.
pub(crate) fn check_elements(
    op: &'static str,
    element: &[u32],
    nnodes: usize,
    num_elements: usize,
) -> Result<()> {
    if element.len() != nnodes {
        return Err(Error::shape_mismatch(op, &[nnodes], &[element.len()]));
    }
    if let Some((i, e)) = element
        .iter()
        .enumerate()
        .find(|(_, e)| **e as usize >= num_elements)
    {
        return Err(Error::unsupported(format!(
            "{op}: element[{i}] = {e} but only {num_elements} elements are configured"
        )));
    }
    Ok(())
}
