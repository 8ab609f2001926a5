use std::borrow::Cow;

#[cfg(feature = "cuda")]
use crate::cuda_backend::CudaStorage;
use crate::{cpu_storage::CpuStorage, DType, Device, Result};

pub enum Storage<T: DType> {
    #[cfg(feature = "cuda")]
    Cuda(CudaStorage<T>),
    Cpu(CpuStorage<T>),
}

impl<T: DType> Storage<T> {
    pub(crate) fn to_cpu_storage(&self) -> Result<Cow<'_, CpuStorage<T>>> {
        match self {
            Self::Cpu(cpu) => cpu.to_cpu_storage(),
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => cuda.to_cpu_storage(),
        }
    }

    pub(crate) fn device(&self) -> Device {
        match self {
            Self::Cpu(_) => Device::Cpu,
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => Device::Cuda(cuda.device().clone()),
        }
    }
}

/// Graph-side inputs and extents of one tensor-product call.
///
/// `row_offsets` are the CSR offsets of the sorted receiver, so edges
/// `row_offsets[n]..row_offsets[n + 1]` all point at node `n`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TensorProductProblem<'a> {
    pub receiver: &'a [u32],
    pub row_offsets: &'a [u32],
    pub lm_to_degree: &'a [u32],
    pub nnodes: usize,
    pub nedges: usize,
    pub num_lm: usize,
    pub num_degrees: usize,
    pub channels: usize,
    pub min_rows_per_task: usize,
}

/// Edge-local gradients: `[E, C]`, `[E, M]` and `[E, L, C]`.
pub(crate) struct EdgeGrads<S> {
    pub feature: S,
    pub harmonic: S,
    pub radial: S,
}

pub trait BackendStorage<T: DType> {
    fn to_cpu_storage(&self) -> Result<Cow<'_, CpuStorage<T>>>;
}

pub(crate) trait BackendDevice {
    type Storage<X: DType>: BackendStorage<X>;

    fn storage_from_vec<T: DType>(&self, data: Vec<T>) -> Result<Self::Storage<T>>;

    /// `out[i, :] = src[index[i], :]` for rows of `row_len` elements.
    fn gather_rows<T: DType>(
        &self,
        src: &Self::Storage<T>,
        index: &[u32],
        row_len: usize,
    ) -> Result<Self::Storage<T>>;

    fn tensor_product_forward<T: DType>(
        &self,
        problem: &TensorProductProblem<'_>,
        feature: &Self::Storage<T>,
        harmonic: &Self::Storage<T>,
        radial: &Self::Storage<T>,
    ) -> Result<Self::Storage<T>>;

    fn tensor_product_backward<T: DType>(
        &self,
        problem: &TensorProductProblem<'_>,
        feature: &Self::Storage<T>,
        harmonic: &Self::Storage<T>,
        radial: &Self::Storage<T>,
        grad_output: &Self::Storage<T>,
    ) -> Result<EdgeGrads<Self::Storage<T>>>;
}
