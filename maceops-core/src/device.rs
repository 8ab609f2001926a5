use std::fmt;

#[cfg(feature = "cuda")]
use crate::cuda_backend::CudaDevice;
use crate::{
    cpu_storage::CpuDevice,
    storage::{BackendDevice, EdgeGrads, Storage, TensorProductProblem},
    DType, Error, Result,
};

/// A concrete device.
#[derive(Clone)]
pub enum Device {
    #[cfg(feature = "cuda")]
    Cuda(CudaDevice),
    Cpu,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => write!(f, "Cuda({})", cuda.ordinal()),
            Self::Cpu => write!(f, "Cpu"),
        }
    }
}

impl Device {
    /// Open CUDA device `ordinal`.
    #[cfg(feature = "cuda")]
    pub fn cuda(ordinal: usize) -> Result<Self> {
        Ok(Self::Cuda(CudaDevice::new(ordinal)?))
    }

    /// Open CUDA device `ordinal`.
    #[cfg(not(feature = "cuda"))]
    pub fn cuda(_ordinal: usize) -> Result<Self> {
        Err(Error::device("maceops-core was built without the `cuda` feature"))
    }

    /// CUDA device `ordinal` if one can be opened, the CPU otherwise.
    pub fn best(ordinal: usize) -> Self {
        Self::cuda(ordinal).unwrap_or(Self::Cpu)
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }

    pub fn same_device(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cpu, Self::Cpu) => true,
            #[cfg(feature = "cuda")]
            (Self::Cuda(a), Self::Cuda(b)) => a.ordinal() == b.ordinal(),
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }

    pub(crate) fn storage_from_vec<T: DType>(&self, data: Vec<T>) -> Result<Storage<T>> {
        match self {
            #[cfg(feature = "cuda")]
            Self::Cuda(cuda) => Ok(Storage::Cuda(cuda.storage_from_vec(data)?)),
            Self::Cpu => Ok(Storage::Cpu(CpuDevice.storage_from_vec(data)?)),
        }
    }

    pub(crate) fn gather_rows<T: DType>(
        &self,
        src: &Storage<T>,
        index: &[u32],
        row_len: usize,
    ) -> Result<Storage<T>> {
        match (self, src) {
            #[cfg(feature = "cuda")]
            (Self::Cuda(cuda), Storage::Cuda(src)) => {
                Ok(Storage::Cuda(cuda.gather_rows(src, index, row_len)?))
            }
            (Self::Cpu, Storage::Cpu(src)) => {
                Ok(Storage::Cpu(CpuDevice.gather_rows(src, index, row_len)?))
            }
            #[allow(unreachable_patterns)]
            _ => Err(mismatch("gather_rows")),
        }
    }

    pub(crate) fn tensor_product_forward<T: DType>(
        &self,
        problem: &TensorProductProblem<'_>,
        feature: &Storage<T>,
        harmonic: &Storage<T>,
        radial: &Storage<T>,
    ) -> Result<Storage<T>> {
        match (self, feature, harmonic, radial) {
            #[cfg(feature = "cuda")]
            (Self::Cuda(cuda), Storage::Cuda(x), Storage::Cuda(y), Storage::Cuda(r)) => Ok(
                Storage::Cuda(cuda.tensor_product_forward(problem, x, y, r)?),
            ),
            (Self::Cpu, Storage::Cpu(x), Storage::Cpu(y), Storage::Cpu(r)) => Ok(Storage::Cpu(
                CpuDevice.tensor_product_forward(problem, x, y, r)?,
            )),
            #[allow(unreachable_patterns)]
            _ => Err(mismatch("tensor_product_forward")),
        }
    }

    pub(crate) fn tensor_product_backward<T: DType>(
        &self,
        problem: &TensorProductProblem<'_>,
        feature: &Storage<T>,
        harmonic: &Storage<T>,
        radial: &Storage<T>,
        grad_output: &Storage<T>,
    ) -> Result<EdgeGrads<Storage<T>>> {
        match (self, feature, harmonic, radial, grad_output) {
            #[cfg(feature = "cuda")]
            (
                Self::Cuda(cuda),
                Storage::Cuda(x),
                Storage::Cuda(y),
                Storage::Cuda(r),
                Storage::Cuda(g),
            ) => {
                let grads = cuda.tensor_product_backward(problem, x, y, r, g)?;
                Ok(EdgeGrads {
                    feature: Storage::Cuda(grads.feature),
                    harmonic: Storage::Cuda(grads.harmonic),
                    radial: Storage::Cuda(grads.radial),
                })
            }
            (Self::Cpu, Storage::Cpu(x), Storage::Cpu(y), Storage::Cpu(r), Storage::Cpu(g)) => {
                let grads = CpuDevice.tensor_product_backward(problem, x, y, r, g)?;
                Ok(EdgeGrads {
                    feature: Storage::Cpu(grads.feature),
                    harmonic: Storage::Cpu(grads.harmonic),
                    radial: Storage::Cpu(grads.radial),
                })
            }
            #[allow(unreachable_patterns)]
            _ => Err(mismatch("tensor_product_backward")),
        }
    }
}

fn mismatch(op: &str) -> Error {
    Error::device(format!("{op}: operands live on different devices"))
}
