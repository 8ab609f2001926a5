use std::{
    fmt::Debug,
    ops::{Add, AddAssign, Div, Mul, Sub},
};

#[cfg(feature = "bfloat")]
use half::bf16;
#[cfg(feature = "half")]
use half::f16;

#[cfg(feature = "cuda")]
use cudarc::driver::{DeviceRepr, ValidAsZeroBits};

pub use self::gemm::GemmDispatch;
pub use self::rand::RandDispatch;

mod gemm;
mod rand;

/// Scalar type kernels accumulate into.
///
/// Reductions never accumulate below the storage precision: half types
/// accumulate in `f32`, `f32` in `f32`, and `f64` in `f64`.
pub trait Accumulator:
    Copy
    + Debug
    + Send
    + Sync
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + AddAssign
    + 'static
{
    const ZERO: Self;

    fn to_f64(self) -> f64;
    fn from_f64(x: f64) -> Self;
}

macro_rules! accumulator {
    ($rt:ident) => {
        impl Accumulator for $rt {
            const ZERO: $rt = 0.;

            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(x: f64) -> Self {
                x as $rt
            }
        }
    };
}

accumulator!(f32);
accumulator!(f64);

pub trait DTypeOps:
    Copy
    + Add<Output = Self>
    + Div<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + PartialOrd
    + GemmDispatch
    + RandDispatch
{
}

#[cfg(feature = "cuda")]
pub trait DeviceReprLike: DeviceRepr + ValidAsZeroBits {}

#[cfg(not(feature = "cuda"))]
pub trait DeviceReprLike {}

impl DeviceReprLike for f32 {}
impl DeviceReprLike for f64 {}

/// Marker trait for tensor datatypes.
///
/// Every public entry point takes tensors of exactly one `DType`; there is no
/// implicit promotion between element widths.
pub trait DType: Debug + Clone + DTypeOps + Send + Sync + DeviceReprLike + 'static {
    const ZERO: Self;
    const ONE: Self;
    const NAME: &'static str;
    const C_NAME: &'static str;
    const C_DEP: Option<&'static str>;
    /// C name of [`DType::Acc`], used when generating device kernels.
    const ACC_C_NAME: &'static str;

    type Acc: Accumulator;

    fn to_acc(self) -> Self::Acc;
    fn from_acc(acc: Self::Acc) -> Self;
    fn to_f64(&self) -> f64;
    fn from_f64(x: f64) -> Self;
}

macro_rules! dtype {
    ($rt:ident, $zero:expr, $one:expr, $repr:expr, $c_repr:expr) => {
        impl DTypeOps for $rt {}
        impl DType for $rt {
            const ZERO: $rt = $zero;
            const ONE: $rt = $one;
            const NAME: &'static str = $repr;
            const C_NAME: &'static str = $c_repr;
            const C_DEP: Option<&'static str> = None;
            const ACC_C_NAME: &'static str = $c_repr;

            type Acc = $rt;

            fn to_acc(self) -> Self::Acc {
                self
            }
            fn from_acc(acc: Self::Acc) -> Self {
                acc
            }
            fn to_f64(&self) -> f64 {
                *self as f64
            }
            fn from_f64(x: f64) -> Self {
                x as $rt
            }
        }
    };
}

dtype!(f32, 0f32, 1f32, "f32", "float");
dtype!(f64, 0f64, 1f64, "f64", "double");

macro_rules! half_dtype {
    ($rt:ident, $repr:expr, $c_repr:expr, $c_dep:expr) => {
        impl DTypeOps for $rt {}
        impl DeviceReprLike for $rt {}
        impl DType for $rt {
            const ZERO: $rt = $rt::from_f64_const(0.0);
            const ONE: $rt = $rt::from_f64_const(1.0);
            const NAME: &'static str = $repr;
            const C_NAME: &'static str = $c_repr;
            const C_DEP: Option<&'static str> = Some($c_dep);
            const ACC_C_NAME: &'static str = "float";

            type Acc = f32;

            fn to_acc(self) -> Self::Acc {
                self.to_f32()
            }
            fn from_acc(acc: Self::Acc) -> Self {
                Self::from_f32(acc)
            }
            fn to_f64(&self) -> f64 {
                self.to_f64_const()
            }
            fn from_f64(x: f64) -> Self {
                Self::from_f64_const(x)
            }
        }
    };
}

#[cfg(feature = "half")]
half_dtype!(f16, "f16", "__half", "#include \"cuda_fp16.h\"");
#[cfg(feature = "bfloat")]
half_dtype!(bf16, "bf16", "__nv_bfloat16", "#include \"cuda_bf16.h\"");
