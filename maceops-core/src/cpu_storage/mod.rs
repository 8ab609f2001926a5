use std::borrow::Cow;

use rayon::prelude::*;

use crate::{
    dtype::Accumulator,
    reduce::segmented_rows,
    storage::{BackendDevice, BackendStorage, EdgeGrads, TensorProductProblem},
    DType, Result,
};

pub struct CpuDevice;

#[derive(Clone, Debug)]
pub struct CpuStorage<T: DType>(pub(crate) Vec<T>);

impl<T: DType> BackendStorage<T> for CpuStorage<T> {
    fn to_cpu_storage(&self) -> Result<Cow<'_, CpuStorage<T>>> {
        Ok(Cow::Borrowed(self))
    }
}

impl BackendDevice for CpuDevice {
    type Storage<X: DType> = CpuStorage<X>;

    fn storage_from_vec<T: DType>(&self, data: Vec<T>) -> Result<Self::Storage<T>> {
        Ok(CpuStorage(data))
    }

    fn gather_rows<T: DType>(
        &self,
        src: &Self::Storage<T>,
        index: &[u32],
        row_len: usize,
    ) -> Result<Self::Storage<T>> {
        let mut out = vec![T::ZERO; index.len() * row_len];
        if row_len > 0 {
            out.par_chunks_mut(row_len)
                .zip(index.par_iter())
                .for_each(|(dst, &i)| {
                    let i = i as usize;
                    dst.copy_from_slice(&src.0[i * row_len..(i + 1) * row_len]);
                });
        }
        Ok(CpuStorage(out))
    }

    fn tensor_product_forward<T: DType>(
        &self,
        p: &TensorProductProblem<'_>,
        feature: &Self::Storage<T>,
        harmonic: &Self::Storage<T>,
        radial: &Self::Storage<T>,
    ) -> Result<Self::Storage<T>> {
        let (m_dim, c_dim, l_dim) = (p.num_lm, p.channels, p.num_degrees);
        let (x, y, r) = (&feature.0, &harmonic.0, &radial.0);
        let mut out = vec![T::ZERO; p.nnodes * m_dim * c_dim];

        segmented_rows(
            &mut out,
            m_dim * c_dim,
            p.receiver,
            p.row_offsets,
            p.min_rows_per_task,
            |edge, acc: &mut [T::Acc]| {
                let x = &x[edge * c_dim..(edge + 1) * c_dim];
                let y = &y[edge * m_dim..(edge + 1) * m_dim];
                let r = &r[edge * l_dim * c_dim..(edge + 1) * l_dim * c_dim];
                for (m, &ym) in y.iter().enumerate() {
                    let ym = ym.to_acc();
                    let l = p.lm_to_degree[m] as usize;
                    let r = &r[l * c_dim..(l + 1) * c_dim];
                    let acc = &mut acc[m * c_dim..(m + 1) * c_dim];
                    for ((a, &xc), &rc) in acc.iter_mut().zip(x).zip(r) {
                        *a += xc.to_acc() * ym * rc.to_acc();
                    }
                }
            },
        );
        Ok(CpuStorage(out))
    }

    fn tensor_product_backward<T: DType>(
        &self,
        p: &TensorProductProblem<'_>,
        feature: &Self::Storage<T>,
        harmonic: &Self::Storage<T>,
        radial: &Self::Storage<T>,
        grad_output: &Self::Storage<T>,
    ) -> Result<EdgeGrads<Self::Storage<T>>> {
        let (m_dim, c_dim, l_dim) = (p.num_lm, p.channels, p.num_degrees);
        let (x, y, r, g) = (&feature.0, &harmonic.0, &radial.0, &grad_output.0);

        let mut gx = vec![T::ZERO; p.nedges * c_dim];
        let mut gy = vec![T::ZERO; p.nedges * m_dim];
        let mut gr = vec![T::ZERO; p.nedges * l_dim * c_dim];
        if p.nedges == 0 || c_dim == 0 {
            return Ok(EdgeGrads {
                feature: CpuStorage(gx),
                harmonic: CpuStorage(gy),
                radial: CpuStorage(gr),
            });
        }

        let zero = <T::Acc as Accumulator>::ZERO;
        gx.par_chunks_mut(c_dim)
            .zip(gy.par_chunks_mut(m_dim))
            .zip(gr.par_chunks_mut(l_dim * c_dim))
            .enumerate()
            .with_min_len(p.min_rows_per_task)
            .for_each_init(
                || (vec![zero; c_dim], vec![zero; m_dim], vec![zero; l_dim * c_dim]),
                |(ax, ay, ar), (edge, ((gx, gy), gr))| {
                    ax.fill(zero);
                    ay.fill(zero);
                    ar.fill(zero);
                    let node = p.receiver[edge] as usize;
                    let x = &x[edge * c_dim..(edge + 1) * c_dim];
                    let y = &y[edge * m_dim..(edge + 1) * m_dim];
                    let r = &r[edge * l_dim * c_dim..(edge + 1) * l_dim * c_dim];
                    let g = &g[node * m_dim * c_dim..(node + 1) * m_dim * c_dim];

                    for m in 0..m_dim {
                        let l = p.lm_to_degree[m] as usize;
                        let ym = y[m].to_acc();
                        let mut sum_y = zero;
                        for c in 0..c_dim {
                            let gmc = g[m * c_dim + c].to_acc();
                            let xc = x[c].to_acc();
                            let rc = r[l * c_dim + c].to_acc();
                            ax[c] += gmc * ym * rc;
                            sum_y += gmc * xc * rc;
                            ar[l * c_dim + c] += gmc * xc * ym;
                        }
                        ay[m] = sum_y;
                    }

                    for (d, a) in gx.iter_mut().zip(ax.iter()) {
                        *d = T::from_acc(*a);
                    }
                    for (d, a) in gy.iter_mut().zip(ay.iter()) {
                        *d = T::from_acc(*a);
                    }
                    for (d, a) in gr.iter_mut().zip(ar.iter()) {
                        *d = T::from_acc(*a);
                    }
                },
            );

        Ok(EdgeGrads {
            feature: CpuStorage(gx),
            harmonic: CpuStorage(gy),
            radial: CpuStorage(gr),
        })
    }
}
