use rayon::prelude::*;

use marten_core::backend::LinalgOps;
use marten_core::error::{Error, Result};
use marten_core::layout::Layout;

use crate::elementwise::FloatElem;
use crate::storage::{dense_mut, with_float, CpuStorage};
use crate::CpuBackend;

// GEMM over strided operands
//
//   dst[i, j] (+)= Σ_p lhs[i, p] * rhs[p, j]
//
// lhs[i, p] is read at  lhs.offset + i*ls0 + p*ls1, and likewise for rhs,
// so a transposed operand is just a layout with swapped strides. Rows of
// dst are computed in parallel; within a row p runs in increasing order,
// which keeps every dot product in a fixed summation order.

fn matmul_typed<T: FloatElem>(
    dst: &mut [T],
    dl: &Layout,
    lhs: &CpuStorage,
    ll: &Layout,
    rhs: &CpuStorage,
    rl: &Layout,
    accumulate: bool,
) -> Result<()> {
    let out = dense_mut("matmul", dst, dl)?;
    let (m, k) = (ll.dims()[0], ll.dims()[1]);
    let n = rl.dims()[1];
    tracing::trace!(m, k, n, accumulate, "cpu matmul");
    if m == 0 || n == 0 {
        return Ok(());
    }
    let a = T::slice(lhs).ok_or_else(|| dtype_error(lhs))?;
    let b = T::slice(rhs).ok_or_else(|| dtype_error(rhs))?;
    let (a0, a1, ao) = (ll.strides()[0], ll.strides()[1], ll.offset());
    let (b0, b1, bo) = (rl.strides()[0], rl.strides()[1], rl.offset());

    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        if !accumulate {
            row.iter_mut().for_each(|v| *v = T::zero());
        }
        let a_row = ao + i * a0;
        for p in 0..k {
            let av = a[a_row + p * a1];
            let b_row = bo + p * b0;
            if b1 == 1 {
                let b_run = &b[b_row..b_row + n];
                for (v, &bv) in row.iter_mut().zip(b_run) {
                    *v = *v + av * bv;
                }
            } else {
                for (j, v) in row.iter_mut().enumerate() {
                    *v = *v + av * b[b_row + j * b1];
                }
            }
        }
    });
    Ok(())
}

fn dtype_error(s: &CpuStorage) -> Error {
    Error::msg(format!(
        "matmul: operand dtype {} differs from the destination",
        marten_core::BackendStorage::dtype(s)
    ))
}

impl LinalgOps for CpuBackend {
    fn matmul_to(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
        accumulate: bool,
    ) -> Result<()> {
        with_float!("matmul", dst, |d: T| matmul_typed::<T>(
            d, dst_layout, lhs, lhs_layout, rhs, rhs_layout, accumulate
        ))
    }
}
