use crate::backend::{Backend, ReduceOp};
use crate::error::{Error, Result};
use crate::tensor::Tensor;

use super::{check_dense, check_dst, reduced_shape};

/// Reduce `src` over `dims` into `dst`.
///
/// `dst` has the reduced shape, either keeping the reduced dims as size 1
/// or dropping them. Both have the same row-major element order, so the
/// kernel is the same. Accumulation runs in a fixed order per output.
pub fn reduce_to<'d, B: Backend>(
    op: ReduceOp,
    dst: &'d Tensor<B>,
    src: &Tensor<B>,
    dims: &[usize],
    keep_dim: bool,
) -> Result<&'d Tensor<B>> {
    let name = op.name();
    let shape = reduced_shape(src.shape(), dims, keep_dim)?;
    check_dst(name, dst, &shape, src.dtype())?;
    check_dense(name, dst)?;
    if src.shares_storage(dst) {
        return Err(Error::invalid_destination(name, "reduction cannot run in place"));
    }
    tracing::trace!(op = name, src = %src.shape(), ?dims, "reduce");
    let s = src.read_storage()?;
    let mut d = dst.write_storage()?;
    B::reduce_to(op, &mut d, dst.layout(), &s, src.layout(), dims)?;
    Ok(dst)
}

pub fn sum_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    src: &Tensor<B>,
    dims: &[usize],
    keep_dim: bool,
) -> Result<&'d Tensor<B>> {
    reduce_to(ReduceOp::Sum, dst, src, dims, keep_dim)
}

pub fn mean_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    src: &Tensor<B>,
    dims: &[usize],
    keep_dim: bool,
) -> Result<&'d Tensor<B>> {
    reduce_to(ReduceOp::Mean, dst, src, dims, keep_dim)
}

pub fn max_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    src: &Tensor<B>,
    dims: &[usize],
    keep_dim: bool,
) -> Result<&'d Tensor<B>> {
    reduce_to(ReduceOp::Max, dst, src, dims, keep_dim)
}

pub fn min_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    src: &Tensor<B>,
    dims: &[usize],
    keep_dim: bool,
) -> Result<&'d Tensor<B>> {
    reduce_to(ReduceOp::Min, dst, src, dims, keep_dim)
}

/// Numerically stable softmax of `src` along `dim`.
pub fn softmax_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    src: &Tensor<B>,
    dim: usize,
) -> Result<&'d Tensor<B>> {
    if dim >= src.rank() {
        return Err(Error::DimOutOfRange {
            dim,
            rank: src.rank(),
        });
    }
    check_dst("softmax", dst, src.shape(), src.dtype())?;
    check_dense("softmax", dst)?;
    if src.shares_storage(dst) {
        return Err(Error::invalid_destination("softmax", "softmax cannot run in place"));
    }
    let s = src.read_storage()?;
    let mut d = dst.write_storage()?;
    B::softmax_to(&mut d, dst.layout(), &s, src.layout(), dim)?;
    Ok(dst)
}
