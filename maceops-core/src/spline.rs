use std::marker::PhantomData;

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::{DType, Device, Error, Result, Tensor};

/// Natural cubic spline of `F` channels over a shared, strictly increasing
/// grid of `n` knots.
///
/// Segment `k` covers `[grid[k], grid[k + 1]]` and evaluates
/// `a + b*dx + c*dx^2 + d*dx^3` with `dx = x - grid[k]`. The constant term is
/// the knot value itself, so queries landing on a knot reproduce the fitted
/// values exactly. The last knot owns a degenerate segment holding its value
/// and the end slope.
#[derive(Clone, Debug)]
pub struct CubicSpline<T: DType> {
    grid: Vec<f64>,
    channels: usize,
    /// `[n, F, 4]`
    coeffs: Vec<f64>,
    _ghost: PhantomData<T>,
}

impl<T: DType> CubicSpline<T> {
    /// Fit `values[n, F]` sampled at `grid[n]`.
    pub fn fit(grid: &Tensor<T>, values: &Tensor<T>) -> Result<Self> {
        let n = grid.shape().dims1("CubicSpline::fit")?;
        let (rows, channels) = values.shape().dims2("CubicSpline::fit")?;
        if rows != n {
            return Err(Error::shape_mismatch(
                "CubicSpline::fit",
                &[n, channels],
                values.dims(),
            ));
        }
        if n < 2 {
            return Err(Error::unsupported(format!(
                "a cubic spline needs at least 2 knots, got {n}"
            )));
        }
        let grid: Vec<f64> = grid
            .cpu_data("CubicSpline::fit")?
            .iter()
            .map(|t| t.to_f64())
            .collect();
        if let Some(k) = (1..n).find(|&k| !(grid[k] > grid[k - 1])) {
            return Err(Error::unsupported(format!(
                "spline grid must be strictly increasing, grid[{}] = {} and grid[{k}] = {}",
                k - 1,
                grid[k - 1],
                grid[k]
            )));
        }
        let y = values.cpu_data("CubicSpline::fit")?;
        let y = |k: usize, f: usize| y[k * channels + f].to_f64();

        let h: Vec<f64> = grid.windows(2).map(|w| w[1] - w[0]).collect();
        let second = natural_second_derivatives(&h, channels, &y);

        let mut coeffs = vec![0f64; n * channels * 4];
        for k in 0..n - 1 {
            for f in 0..channels {
                let (m0, m1) = (second[k * channels + f], second[(k + 1) * channels + f]);
                let slope = (y(k + 1, f) - y(k, f)) / h[k];
                let c = &mut coeffs[(k * channels + f) * 4..(k * channels + f + 1) * 4];
                c[0] = y(k, f);
                c[1] = slope - h[k] * (2.0 * m0 + m1) / 6.0;
                c[2] = m0 / 2.0;
                c[3] = (m1 - m0) / (6.0 * h[k]);
            }
        }
        let last = n - 1;
        let hl = h[last - 1];
        for f in 0..channels {
            let prev = (last - 1) * channels + f;
            let end_slope =
                coeffs[prev * 4 + 1] + 2.0 * coeffs[prev * 4 + 2] * hl + 3.0 * coeffs[prev * 4 + 3] * hl * hl;
            let c = &mut coeffs[(last * channels + f) * 4..(last * channels + f + 1) * 4];
            c[0] = y(last, f);
            c[1] = end_slope;
        }

        debug!(knots = n, channels, "fitted cubic spline");
        Ok(Self {
            grid,
            channels,
            coeffs,
            _ghost: PhantomData,
        })
    }

    pub fn grid(&self) -> &[f64] {
        &self.grid
    }

    pub fn num_knots(&self) -> usize {
        self.grid.len()
    }

    pub fn num_channels(&self) -> usize {
        self.channels
    }

    /// Segment coefficients `[n, F, 4]` ordered `(a, b, c, d)`.
    pub fn coefficients(&self) -> Result<Tensor<T>> {
        let data = self.coeffs.iter().map(|&c| T::from_f64(c)).collect();
        Tensor::from_vec(data, (self.num_knots(), self.channels, 4), &Device::Cpu)
    }

    /// Values at `x[E]`, shaped `[E, F]`.
    pub fn evaluate(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        let x = self.queries("CubicSpline::evaluate", x)?;
        let f = self.channels;
        let mut out = vec![T::ZERO; x.len() * f];
        if f > 0 {
            out.par_chunks_mut(f).zip(x.par_iter()).for_each(|(dst, &q)| {
                let (k, dx) = self.locate(q);
                for (ch, d) in dst.iter_mut().enumerate() {
                    let c = self.segment(k, ch);
                    *d = T::from_f64(c[0] + dx * (c[1] + dx * (c[2] + dx * c[3])));
                }
            });
        }
        Tensor::from_vec(out, (x.len(), f), &Device::Cpu)
    }

    /// Values and first derivatives with respect to `x`, both `[E, F]`.
    pub fn evaluate_with_derivative(&self, x: &Tensor<T>) -> Result<(Tensor<T>, Tensor<T>)> {
        let x = self.queries("CubicSpline::evaluate_with_derivative", x)?;
        let f = self.channels;
        let mut values = vec![T::ZERO; x.len() * f];
        let mut derivs = vec![T::ZERO; x.len() * f];
        if f > 0 {
            values
                .par_chunks_mut(f)
                .zip(derivs.par_chunks_mut(f))
                .zip(x.par_iter())
                .for_each(|((v, d), &q)| {
                    let (k, dx) = self.locate(q);
                    for ch in 0..f {
                        let c = self.segment(k, ch);
                        v[ch] = T::from_f64(c[0] + dx * (c[1] + dx * (c[2] + dx * c[3])));
                        d[ch] = T::from_f64(c[1] + dx * (2.0 * c[2] + 3.0 * dx * c[3]));
                    }
                });
        }
        Ok((
            Tensor::from_vec(values, (x.len(), f), &Device::Cpu)?,
            Tensor::from_vec(derivs, (x.len(), f), &Device::Cpu)?,
        ))
    }

    /// Gradient with respect to the queries: `grad_x[e] = sum_f grad[e, f] * dS_f/dx`.
    pub fn backward(&self, x: &Tensor<T>, grad_output: &Tensor<T>) -> Result<Tensor<T>> {
        const OP: &str = "CubicSpline::backward";
        let xs = self.queries(OP, x)?;
        let f = self.channels;
        grad_output.expect_dims(OP, &[xs.len(), f])?;
        let g = grad_output.cpu_data(OP)?;

        let out: Vec<T> = xs
            .par_iter()
            .enumerate()
            .map(|(e, &q)| {
                let (k, dx) = self.locate(q);
                let sum: f64 = (0..f)
                    .map(|ch| {
                        let c = self.segment(k, ch);
                        g[e * f + ch].to_f64() * (c[1] + dx * (2.0 * c[2] + 3.0 * dx * c[3]))
                    })
                    .sum();
                T::from_f64(sum)
            })
            .collect();
        Tensor::from_vec(out, xs.len(), &Device::Cpu)
    }

    /// Validate every query before any output is produced.
    fn queries(&self, op: &'static str, x: &Tensor<T>) -> Result<Vec<f64>> {
        let e = x.shape().dims1(op)?;
        let (lo, hi) = (self.grid[0], self.grid[self.grid.len() - 1]);
        let xs: Vec<f64> = x
            .cpu_data(op)?
            .iter()
            .map(|q| q.to_f64())
            .collect();
        if let Some(&q) = xs.iter().find(|&&q| !(q >= lo && q <= hi)) {
            return Err(Error::OutOfDomain { x: q, lo, hi }.bt());
        }
        trace!(queries = e, "evaluating cubic spline");
        Ok(xs)
    }

    /// Segment index and offset into it; `q` must lie inside the grid.
    fn locate(&self, q: f64) -> (usize, f64) {
        let k = self.grid.partition_point(|&t| t <= q).saturating_sub(1);
        (k, q - self.grid[k])
    }

    fn segment(&self, k: usize, ch: usize) -> &[f64] {
        let start = (k * self.channels + ch) * 4;
        &self.coeffs[start..start + 4]
    }
}

/// Second derivatives at the knots, `[n, F]`, with both ends pinned to zero.
/// The interior system is tridiagonal and shared by all channels, so the
/// Thomas elimination factors are computed once.
fn natural_second_derivatives(h: &[f64], channels: usize, y: &impl Fn(usize, usize) -> f64) -> Vec<f64> {
    let n = h.len() + 1;
    let mut second = vec![0f64; n * channels];
    if n < 3 {
        return second;
    }
    let interior = n - 2;

    // Row i couples knots i, i + 1, i + 2 (unknown i is knot i + 1).
    let lower = |i: usize| h[i];
    let diag = |i: usize| 2.0 * (h[i] + h[i + 1]);
    let upper = |i: usize| h[i + 1];

    let mut c_prime = vec![0f64; interior];
    let mut denom = vec![0f64; interior];
    for i in 0..interior {
        denom[i] = if i == 0 {
            diag(0)
        } else {
            diag(i) - lower(i) * c_prime[i - 1]
        };
        c_prime[i] = upper(i) / denom[i];
    }

    let mut d_prime = vec![0f64; interior];
    for f in 0..channels {
        for i in 0..interior {
            let rhs = 6.0
                * ((y(i + 2, f) - y(i + 1, f)) / h[i + 1] - (y(i + 1, f) - y(i, f)) / h[i]);
            d_prime[i] = if i == 0 {
                rhs / denom[0]
            } else {
                (rhs - lower(i) * d_prime[i - 1]) / denom[i]
            };
        }
        let mut next = 0f64;
        for i in (0..interior).rev() {
            let m = d_prime[i] - c_prime[i] * next;
            second[(i + 1) * channels + f] = m;
            next = m;
        }
    }
    second
}
