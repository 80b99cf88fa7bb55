use rayon::prelude::*;

use marten_core::backend::{ReduceOp, ReduceOps};
use marten_core::dtype::WithDType;
use marten_core::error::Result;
use marten_core::layout::Layout;

use crate::elementwise::FloatElem;
use crate::storage::{dense_mut, with_float, CpuStorage, View};
use crate::CpuBackend;

/// Sequential reduction: every source element is visited once in logical
/// order and folded into its output slot, so sums are reproducible.
fn reduce_typed<T: FloatElem>(
    op: ReduceOp,
    dst: &mut [T],
    dl: &Layout,
    src: &CpuStorage,
    sl: &Layout,
    dims: &[usize],
) -> Result<()> {
    let name = op.name();
    let out = dense_mut(name, dst, dl)?;
    let src_dims = sl.dims();
    let rank = src_dims.len();
    let mut reduced = vec![false; rank];
    for &d in dims {
        reduced[d] = true;
    }
    let out_shape = sl.shape().reduced(dims)?;
    let out_strides = out_shape.stride_contiguous();
    let count: usize = dims.iter().map(|&d| src_dims[d]).product();

    let init = match op {
        ReduceOp::Sum | ReduceOp::Mean => T::zero(),
        ReduceOp::Max => T::neg_infinity(),
        ReduceOp::Min => T::infinity(),
    };
    out.iter_mut().for_each(|v| *v = init);

    let s = View::<T>::new(name, src, sl)?;
    for i in 0..sl.elem_count() {
        let mut rem = i;
        let mut o = 0;
        for d in (0..rank).rev() {
            let c = rem % src_dims[d];
            rem /= src_dims[d];
            if !reduced[d] {
                o += c * out_strides[d];
            }
        }
        let x = s.at(i);
        let acc = &mut out[o];
        *acc = match op {
            ReduceOp::Sum | ReduceOp::Mean => *acc + x,
            ReduceOp::Max => acc.max(x),
            ReduceOp::Min => acc.min(x),
        };
    }
    if op == ReduceOp::Mean {
        let n = T::from_f64(count as f64);
        out.iter_mut().for_each(|v| *v = *v / n);
    }
    Ok(())
}

/// `(outer, len, inner)` around `dim`: element `(o, k, j)` sits at logical
/// index `(o * len + k) * inner + j`.
fn split_at_dim(layout: &Layout, dim: usize) -> (usize, usize, usize) {
    let dims = layout.dims();
    let outer = dims[..dim].iter().product();
    let inner = dims[dim + 1..].iter().product();
    (outer, dims[dim], inner)
}

fn softmax_typed<T: FloatElem>(
    dst: &mut [T],
    dl: &Layout,
    src: &CpuStorage,
    sl: &Layout,
    dim: usize,
) -> Result<()> {
    let out = dense_mut("softmax", dst, dl)?;
    let s = View::<T>::new("softmax", src, sl)?;
    let (_, len, inner) = split_at_dim(sl, dim);
    if out.is_empty() {
        return Ok(());
    }
    out.par_chunks_mut(len * inner)
        .enumerate()
        .for_each(|(o, block)| {
            let base = o * len * inner;
            for j in 0..inner {
                let at = |k: usize| s.at(base + k * inner + j);
                let mut max = T::neg_infinity();
                for k in 0..len {
                    max = max.max(at(k));
                }
                let mut sum = T::zero();
                for k in 0..len {
                    let e = (at(k) - max).exp();
                    block[k * inner + j] = e;
                    sum = sum + e;
                }
                for k in 0..len {
                    block[k * inner + j] = block[k * inner + j] / sum;
                }
            }
        });
    Ok(())
}

fn softmax_grad_typed<T: FloatElem>(
    dst: &mut [T],
    dl: &Layout,
    grad: &CpuStorage,
    gl: &Layout,
    output: &CpuStorage,
    ol: &Layout,
    dim: usize,
) -> Result<()> {
    let out = dense_mut("softmax_grad", dst, dl)?;
    let g = View::<T>::new("softmax_grad", grad, gl)?;
    let y = View::<T>::new("softmax_grad", output, ol)?;
    let (_, len, inner) = split_at_dim(ol, dim);
    if out.is_empty() {
        return Ok(());
    }
    out.par_chunks_mut(len * inner)
        .enumerate()
        .for_each(|(o, block)| {
            let base = o * len * inner;
            for j in 0..inner {
                let idx = |k: usize| base + k * inner + j;
                let mut dot = T::zero();
                for k in 0..len {
                    dot = dot + g.at(idx(k)) * y.at(idx(k));
                }
                for k in 0..len {
                    block[k * inner + j] = y.at(idx(k)) * (g.at(idx(k)) - dot);
                }
            }
        });
    Ok(())
}

impl ReduceOps for CpuBackend {
    fn reduce_to(
        op: ReduceOp,
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        src: &CpuStorage,
        src_layout: &Layout,
        dims: &[usize],
    ) -> Result<()> {
        with_float!(op.name(), dst, |d: T| reduce_typed::<T>(
            op, d, dst_layout, src, src_layout, dims
        ))
    }

    fn softmax_to(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        src: &CpuStorage,
        src_layout: &Layout,
        dim: usize,
    ) -> Result<()> {
        with_float!("softmax", dst, |d: T| softmax_typed::<T>(
            d, dst_layout, src, src_layout, dim
        ))
    }

    fn softmax_grad_to(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        grad: &CpuStorage,
        grad_layout: &Layout,
        output: &CpuStorage,
        output_layout: &Layout,
        dim: usize,
    ) -> Result<()> {
        with_float!("softmax_grad", dst, |d: T| softmax_grad_typed::<T>(
            d,
            dst_layout,
            grad,
            grad_layout,
            output,
            output_layout,
            dim
        ))
    }
}

#[cfg(test)]
mod tests {
    use marten_core::ops;
    use marten_core::ErrorKind;

    use crate::test_util::*;

    #[test]
    fn sum_over_batch_and_space() {
        // [2, 2, 1, 2]
        let x = t(&[1., 2., 3., 4., 5., 6., 7., 8.], (2, 2, 1, 2));
        let dst = zeros(2);
        ops::sum_to(&dst, &x, &[0, 2, 3], false).unwrap();
        assert_close(&dst.to_f64_vec().unwrap(), &[1. + 2. + 5. + 6., 3. + 4. + 7. + 8.]);
    }

    #[test]
    fn mean_keep_dim() {
        let x = t(&[1., 2., 3., 4., 5., 6.], (2, 3));
        let dst = zeros((2, 1));
        ops::mean_to(&dst, &x, &[1], true).unwrap();
        assert_close(&dst.to_f64_vec().unwrap(), &[2.0, 5.0]);
    }

    #[test]
    fn max_and_min_over_rows() {
        let x = t(&[3., -1., 2., 0., 7., 5.], (2, 3));
        let hi = zeros(3);
        let lo = zeros(3);
        ops::max_to(&hi, &x, &[0], false).unwrap();
        ops::min_to(&lo, &x, &[0], false).unwrap();
        assert_close(&hi.to_f64_vec().unwrap(), &[3., 7., 5.]);
        assert_close(&lo.to_f64_vec().unwrap(), &[0., -1., 2.]);
    }

    #[test]
    fn reduce_reads_transposed_source() {
        let x = t(&[1., 2., 3., 4., 5., 6.], (2, 3));
        let xt = x.t().unwrap();
        let dst = zeros(3);
        ops::sum_to(&dst, &xt, &[1], false).unwrap();
        assert_close(&dst.to_f64_vec().unwrap(), &[5., 7., 9.]);
    }

    #[test]
    fn reduce_rejects_wrong_destination() {
        let x = t(&[1., 2., 3., 4.], (2, 2));
        let dst = zeros(3);
        let err = ops::sum_to(&dst, &x, &[0], false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDestination);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = t(&[1., 2., 3., 1000., 1000., 1000.], (2, 3));
        let y = zeros((2, 3));
        ops::softmax_to(&y, &x, 1).unwrap();
        let v = y.to_f64_vec().unwrap();
        assert!((v[0] + v[1] + v[2] - 1.0).abs() < 1e-12);
        assert_close(&v[3..], &[1.0 / 3.0; 3]);
    }

    #[test]
    fn softmax_along_leading_dim() {
        let x = t(&[0., 0., 0., 0.], (2, 2));
        let y = zeros((2, 2));
        ops::softmax_to(&y, &x, 0).unwrap();
        assert_close(&y.to_f64_vec().unwrap(), &[0.5; 4]);
    }

    #[test]
    fn softmax_grad_matches_formula() {
        let y = t(&[0.2, 0.3, 0.5], (1, 3));
        let g = t(&[1.0, 0.0, -1.0], (1, 3));
        let dst = zeros((1, 3));
        ops::softmax_grad_to(&dst, &g, &y, 1).unwrap();
        let dot = 0.2 - 0.5;
        assert_close(
            &dst.to_f64_vec().unwrap(),
            &[0.2 * (1.0 - dot), 0.3 * (0.0 - dot), 0.5 * (-1.0 - dot)],
        );
    }

    #[test]
    fn softmax_grad_cannot_run_in_place() {
        let y = t(&[0.5, 0.5], (1, 2));
        let g = t(&[1.0, 0.0], (1, 2));
        let err = ops::softmax_grad_to(&g, &g, &y, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDestination);
    }
}
