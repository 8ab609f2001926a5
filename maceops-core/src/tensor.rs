use std::{borrow::Cow, fmt, sync::Arc};

use crate::{
    dtype::RandDispatch,
    storage::Storage,
    DType, Device, Error, Result, Shape,
};

/// Tensors are dense row-major n dimensional arrays bound to a device.
/// Cloning is cheap: the storage is shared.
#[derive(Clone)]
pub struct Tensor<T: DType> {
    storage: Arc<Storage<T>>,
    shape: Shape,
}

impl<T: DType> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &T::NAME)
            .field("shape", &self.shape.dims())
            .field("device", &self.device())
            .finish()
    }
}

impl<T: DType> Tensor<T> {
    pub(crate) fn from_storage(storage: Storage<T>, shape: impl Into<Shape>) -> Self {
        Self {
            storage: Arc::new(storage),
            shape: shape.into(),
        }
    }

    /// Create a tensor from host data laid out row-major.
    pub fn from_vec(data: Vec<T>, shape: impl Into<Shape>, device: &Device) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::shape_mismatch(
                "from_vec",
                shape.dims(),
                &[data.len()],
            ));
        }
        Ok(Self::from_storage(device.storage_from_vec(data)?, shape))
    }

    pub fn from_slice(data: &[T], shape: impl Into<Shape>, device: &Device) -> Result<Self> {
        Self::from_vec(data.to_vec(), shape, device)
    }

    /// Materialize a tensor filled with some value.
    pub fn full(v: T, shape: impl Into<Shape>, device: &Device) -> Result<Self> {
        let shape = shape.into();
        Self::from_vec(vec![v; shape.elem_count()], shape, device)
    }

    /// Materialize a tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>, device: &Device) -> Result<Self> {
        Self::full(T::ZERO, shape, device)
    }

    /// Materialize a tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>, device: &Device) -> Result<Self> {
        Self::full(T::ONE, shape, device)
    }

    /// Create a tensor filled with zeros with the same shape and device as `self`.
    pub fn zeros_like(&self) -> Result<Self> {
        Self::zeros(self.shape.clone(), &self.device())
    }

    /// Uniform samples in `[lo, hi)`.
    pub fn rand(shape: impl Into<Shape>, lo: T, hi: T, device: &Device) -> Result<Self> {
        Self::rand_impl(shape.into(), lo, hi, None, device)
    }

    /// Uniform samples in `[lo, hi)` from a seeded generator.
    pub fn rand_seeded(
        shape: impl Into<Shape>,
        lo: T,
        hi: T,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        Self::rand_impl(shape.into(), lo, hi, Some(seed), device)
    }

    /// Normally distributed samples.
    pub fn randn(shape: impl Into<Shape>, mean: T, std: T, device: &Device) -> Result<Self> {
        Self::randn_impl(shape.into(), mean, std, None, device)
    }

    /// Normally distributed samples from a seeded generator.
    pub fn randn_seeded(
        shape: impl Into<Shape>,
        mean: T,
        std: T,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        Self::randn_impl(shape.into(), mean, std, Some(seed), device)
    }

    fn rand_impl(shape: Shape, lo: T, hi: T, seed: Option<u64>, device: &Device) -> Result<Self> {
        let mut data = vec![T::ZERO; shape.elem_count()];
        T::fill_with_uniform(&mut data, lo.to_f64(), hi.to_f64(), seed)?;
        Self::from_vec(data, shape, device)
    }

    fn randn_impl(
        shape: Shape,
        mean: T,
        std: T,
        seed: Option<u64>,
        device: &Device,
    ) -> Result<Self> {
        let mut data = vec![T::ZERO; shape.elem_count()];
        T::fill_with_normal(&mut data, mean.to_f64(), std.to_f64(), seed)?;
        Self::from_vec(data, shape, device)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    /// Get data for a tensor. Copies from the device when the tensor is not
    /// on the CPU.
    pub fn data(&self) -> Result<Cow<'_, [T]>> {
        match self.storage.to_cpu_storage()? {
            Cow::Borrowed(cpu) => Ok(Cow::Borrowed(&cpu.0)),
            Cow::Owned(cpu) => Ok(Cow::Owned(cpu.0)),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        Ok(self.data()?.into_owned())
    }

    /// Copy this tensor onto `device`; a no-op when it already lives there.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        if self.device().same_device(device) {
            return Ok(self.clone());
        }
        Self::from_vec(self.to_vec()?, self.shape.clone(), device)
    }

    /// Reinterpret the row-major data with another shape of the same size.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::shape_mismatch(
                "reshape",
                shape.dims(),
                self.dims(),
            ));
        }
        Ok(Self {
            storage: self.storage.clone(),
            shape,
        })
    }

    pub(crate) fn storage(&self) -> &Storage<T> {
        &self.storage
    }

    /// Host view of a CPU tensor. Layers without a device kernel use this and
    /// reject accelerator tensors.
    #[cfg_attr(not(feature = "cuda"), allow(unused_variables))]
    pub(crate) fn cpu_data(&self, op: &'static str) -> Result<&[T]> {
        match self.storage.as_ref() {
            Storage::Cpu(cpu) => Ok(&cpu.0[..self.elem_count()]),
            #[cfg(feature = "cuda")]
            Storage::Cuda(_) => Err(Error::device(format!(
                "{op} is only implemented for CPU tensors"
            ))),
        }
    }

    pub(crate) fn expect_dims(&self, op: &'static str, expected: &[usize]) -> Result<()> {
        if self.dims() != expected {
            return Err(Error::shape_mismatch(op, expected, self.dims()));
        }
        Ok(())
    }
}

pub(crate) fn same_device<T: DType>(op: &'static str, tensors: &[&Tensor<T>]) -> Result<Device> {
    let device = match tensors.first() {
        Some(t) => t.device(),
        None => return Ok(Device::Cpu),
    };
    if let Some(t) = tensors.iter().find(|t| !t.device().same_device(&device)) {
        return Err(Error::device(format!(
            "{op}: expected all operands on {device:?}, found one on {:?}",
            t.device()
        )));
    }
    Ok(device)
}
