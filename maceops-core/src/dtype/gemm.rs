use ::gemm::{gemm, Parallelism};

#[cfg(feature = "bfloat")]
use half::bf16;
#[cfg(feature = "half")]
use half::f16;

/// Number of elements a `rows x cols` matrix with `[row_stride, col_stride]`
/// spans, i.e. the minimum slice length backing it.
pub(crate) fn required_len(rows: usize, cols: usize, stride: [usize; 2]) -> usize {
    if rows == 0 || cols == 0 {
        0
    } else {
        (rows - 1) * stride[0] + (cols - 1) * stride[1] + 1
    }
}

pub trait GemmDispatch {
    /// Single strided matrix product, `out = alpha * out + beta * lhs @ rhs`
    /// with `lhs: m x k`, `rhs: k x n`, `out: m x n`. Strides are
    /// `[row_stride, col_stride]` in elements. `out` is not read when
    /// `alpha` is zero.
    #[allow(clippy::too_many_arguments)]
    fn launch_gemm(
        lhs: &[Self],
        lhs_stride: [usize; 2],
        rhs: &[Self],
        rhs_stride: [usize; 2],
        m: usize,
        n: usize,
        k: usize,
        out: &mut [Self],
        out_stride: [usize; 2],
        alpha: Self,
        beta: Self,
        parallel: bool,
    ) where
        Self: Sized;
}

fn check_extents(
    lhs: usize,
    lhs_stride: [usize; 2],
    rhs: usize,
    rhs_stride: [usize; 2],
    (m, n, k): (usize, usize, usize),
    out: usize,
    out_stride: [usize; 2],
) {
    assert!(required_len(m, k, lhs_stride) <= lhs, "gemm lhs out of bounds");
    assert!(required_len(k, n, rhs_stride) <= rhs, "gemm rhs out of bounds");
    assert!(required_len(m, n, out_stride) <= out, "gemm out out of bounds");
}

macro_rules! instantiate_gemm {
    ($rt:ident, NAIVE) => {
        impl GemmDispatch for $rt {
            fn launch_gemm(
                lhs: &[Self],
                lhs_stride: [usize; 2],
                rhs: &[Self],
                rhs_stride: [usize; 2],
                m: usize,
                n: usize,
                k: usize,
                out: &mut [Self],
                out_stride: [usize; 2],
                alpha: Self,
                beta: Self,
                _parallel: bool,
            ) where
                Self: Sized,
            {
                use crate::dtype::{Accumulator, DType};

                check_extents(
                    lhs.len(),
                    lhs_stride,
                    rhs.len(),
                    rhs_stride,
                    (m, n, k),
                    out.len(),
                    out_stride,
                );
                let read_dst = alpha != <$rt as DType>::ZERO;
                let alpha = alpha.to_acc();
                let beta = beta.to_acc();

                for i in 0..m {
                    for j in 0..n {
                        let mut sum = <<$rt as DType>::Acc as Accumulator>::ZERO;
                        for p in 0..k {
                            let lhs_val = lhs[i * lhs_stride[0] + p * lhs_stride[1]].to_acc();
                            let rhs_val = rhs[p * rhs_stride[0] + j * rhs_stride[1]].to_acc();
                            sum += lhs_val * rhs_val;
                        }
                        let out_idx = i * out_stride[0] + j * out_stride[1];
                        let prev = if read_dst {
                            alpha * out[out_idx].to_acc()
                        } else {
                            <<$rt as DType>::Acc as Accumulator>::ZERO
                        };
                        out[out_idx] = <$rt as DType>::from_acc(prev + beta * sum);
                    }
                }
            }
        }
    };

    ($rt:ident, $zero:expr, GEMM) => {
        impl GemmDispatch for $rt {
            fn launch_gemm(
                lhs: &[Self],
                lhs_stride: [usize; 2],
                rhs: &[Self],
                rhs_stride: [usize; 2],
                m: usize,
                n: usize,
                k: usize,
                out: &mut [Self],
                out_stride: [usize; 2],
                alpha: Self,
                beta: Self,
                parallel: bool,
            ) where
                Self: Sized,
            {
                check_extents(
                    lhs.len(),
                    lhs_stride,
                    rhs.len(),
                    rhs_stride,
                    (m, n, k),
                    out.len(),
                    out_stride,
                );
                if m == 0 || n == 0 {
                    return;
                }
                if k == 0 {
                    // gemm with an empty inner dimension only scales dst
                    for i in 0..m {
                        for j in 0..n {
                            let idx = i * out_stride[0] + j * out_stride[1];
                            out[idx] = if alpha != $zero { alpha * out[idx] } else { $zero };
                        }
                    }
                    return;
                }

                let num_threads = num_cpus::get();
                let parallelism = if parallel && num_threads > 1 {
                    Parallelism::Rayon(num_threads)
                } else {
                    Parallelism::None
                };
                let read_dst = alpha != $zero;

                // Bounds were checked above against every strided access.
                unsafe {
                    gemm(
                        /* m: usize = */ m,
                        /* n: usize = */ n,
                        /* k: usize = */ k,
                        /* dst: *mut T = */ out.as_mut_ptr(),
                        /* dst_cs: isize = */ out_stride[1] as isize,
                        /* dst_rs: isize = */ out_stride[0] as isize,
                        /* read_dst: bool = */ read_dst,
                        /* lhs: *const T = */ lhs.as_ptr(),
                        /* lhs_cs: isize = */ lhs_stride[1] as isize,
                        /* lhs_rs: isize = */ lhs_stride[0] as isize,
                        /* rhs: *const T = */ rhs.as_ptr(),
                        /* rhs_cs: isize = */ rhs_stride[1] as isize,
                        /* rhs_rs: isize = */ rhs_stride[0] as isize,
                        /* alpha: T = */ alpha,
                        /* beta: T = */ beta,
                        /* conj_dst: bool = */ false,
                        /* conj_lhs: bool = */ false,
                        /* conj_rhs: bool = */ false,
                        parallelism,
                    )
                }
            }
        }
    };
}

instantiate_gemm!(f32, 0., GEMM);
instantiate_gemm!(f64, 0., GEMM);
#[cfg(feature = "bfloat")]
// Use naive implementation for bf16 to avoid CPU SIMD half-precision assembly requirements
instantiate_gemm!(bf16, NAIVE);
#[cfg(feature = "half")]
// Use naive implementation for f16 to avoid CPU SIMD half-precision assembly requirements
instantiate_gemm!(f16, NAIVE);
