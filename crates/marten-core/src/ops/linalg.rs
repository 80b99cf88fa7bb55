use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

use super::{check_dense, check_dst, check_same_dtype};

fn matmul_impl<'d, B: Backend>(
    op: &'static str,
    dst: &'d Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
    accumulate: bool,
) -> Result<&'d Tensor<B>> {
    for t in [lhs, rhs] {
        if t.rank() != 2 {
            return Err(Error::RankMismatch {
                op,
                expected: 2,
                got: t.rank(),
            });
        }
    }
    let (m, k1) = (lhs.dims()[0], lhs.dims()[1]);
    let (k2, n) = (rhs.dims()[0], rhs.dims()[1]);
    if k1 != k2 {
        return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
    }
    check_same_dtype(op, lhs.dtype(), rhs.dtype())?;
    check_dst(op, dst, &Shape::from((m, n)), lhs.dtype())?;
    check_dense(op, dst)?;
    if lhs.shares_storage(dst) || rhs.shares_storage(dst) {
        return Err(Error::invalid_destination(op, "matmul cannot run in place"));
    }
    tracing::trace!(op, m, k = k1, n, "matmul");
    let l = lhs.read_storage()?;
    let r = rhs.read_storage()?;
    let mut d = dst.write_storage()?;
    B::matmul_to(
        &mut d,
        dst.layout(),
        &l,
        lhs.layout(),
        &r,
        rhs.layout(),
        accumulate,
    )?;
    Ok(dst)
}

/// `dst = lhs @ rhs` for rank-2 operands.
///
/// Pass `x.t()?` for a transposed operand; the kernel reads it through its
/// strides without a copy.
pub fn matmul_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    matmul_impl("matmul", dst, lhs, rhs, false)
}

/// `dst += lhs @ rhs`.
pub fn matmul_acc_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    matmul_impl("matmul_acc", dst, lhs, rhs, true)
}
