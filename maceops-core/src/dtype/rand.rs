use ::rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};

#[cfg(feature = "bfloat")]
use half::bf16;
#[cfg(feature = "half")]
use half::f16;

use crate::{Error, Result};

fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut ::rand::rng()),
    }
}

/// Dispatch random fills based on the data type.
///
/// Samples are drawn in `f64` and narrowed, so every dtype sees the same
/// sequence for a given seed.
pub trait RandDispatch {
    fn fill_with_uniform(buf: &mut [Self], lo: f64, hi: f64, seed: Option<u64>) -> Result<()>
    where
        Self: Sized;

    fn fill_with_normal(buf: &mut [Self], mean: f64, std: f64, seed: Option<u64>) -> Result<()>
    where
        Self: Sized;
}

macro_rules! rand_dispatch {
    ($rt:ident) => {
        impl RandDispatch for $rt {
            fn fill_with_uniform(
                buf: &mut [Self],
                lo: f64,
                hi: f64,
                seed: Option<u64>,
            ) -> Result<()> {
                let dist = Uniform::new(lo, hi).map_err(Error::wrap)?;
                let mut rng = rng(seed);
                for x in buf.iter_mut() {
                    *x = <$rt as crate::DType>::from_f64(dist.sample(&mut rng));
                }
                Ok(())
            }

            fn fill_with_normal(
                buf: &mut [Self],
                mean: f64,
                std: f64,
                seed: Option<u64>,
            ) -> Result<()> {
                let dist = Normal::new(mean, std).map_err(Error::wrap)?;
                let mut rng = rng(seed);
                for x in buf.iter_mut() {
                    *x = <$rt as crate::DType>::from_f64(dist.sample(&mut rng));
                }
                Ok(())
            }
        }
    };
}

rand_dispatch!(f32);
rand_dispatch!(f64);
#[cfg(feature = "half")]
rand_dispatch!(f16);
#[cfg(feature = "bfloat")]
rand_dispatch!(bf16);
