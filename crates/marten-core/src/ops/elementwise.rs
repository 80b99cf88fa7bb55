use crate::backend::{Backend, BinaryOp, CmpOp, Operand, UnaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Broadcast;
use crate::tensor::Tensor;

use super::{check_dst, check_same_dtype, check_writable, Source};

/// Set every element of `dst` to `value`.
pub fn fill<B: Backend>(dst: &Tensor<B>, value: f64) -> Result<&Tensor<B>> {
    check_writable("fill", dst)?;
    let mut storage = dst.write_storage()?;
    B::fill(&mut storage, dst.layout(), value)?;
    Ok(dst)
}

/// Redraw every element of `dst` uniformly from [0, 1).
pub fn fill_uniform<B: Backend>(dst: &Tensor<B>) -> Result<&Tensor<B>> {
    check_writable("fill_uniform", dst)?;
    if !dst.dtype().is_float() {
        return Err(Error::invalid_destination(
            "fill_uniform",
            format!("dtype {} cannot hold uniform samples", dst.dtype()),
        ));
    }
    let mut storage = dst.write_storage()?;
    B::fill_uniform(&mut storage, dst.layout())?;
    Ok(dst)
}

/// `dst = src`, same shape.
pub fn copy_to<'d, B: Backend>(dst: &'d Tensor<B>, src: &Tensor<B>) -> Result<&'d Tensor<B>> {
    check_dst("copy", dst, src.shape(), src.dtype())?;
    if src.shares_storage(dst) {
        if src.layout() == dst.layout() {
            return Ok(dst);
        }
        return Err(Error::invalid_destination(
            "copy",
            "destination overlaps the source with a different layout",
        ));
    }
    let s = src.read_storage()?;
    let mut d = dst.write_storage()?;
    B::copy_to(&mut d, dst.layout(), &s, src.layout())?;
    Ok(dst)
}

/// `dst = broadcast(src)`: repeats `src` along the dims where it has size 1.
pub fn expand_to<'d, B: Backend>(dst: &'d Tensor<B>, src: &Tensor<B>) -> Result<&'d Tensor<B>> {
    if !Broadcast::expands_to(src.shape(), dst.shape()) {
        return Err(Error::ShapeMismatch {
            op: "expand",
            lhs: src.shape().clone(),
            rhs: dst.shape().clone(),
        });
    }
    check_dst("expand", dst, dst.shape(), src.dtype())?;
    if src.shares_storage(dst) {
        return Err(Error::invalid_destination(
            "expand",
            "destination aliases the broadcast source",
        ));
    }
    let layout = src.layout().broadcast_as(dst.shape())?;
    let s = src.read_storage()?;
    let mut d = dst.write_storage()?;
    B::copy_to(&mut d, dst.layout(), &s, &layout)?;
    Ok(dst)
}

/// `dst = op(src)`. Safe in place.
pub fn unary_to<'d, B: Backend>(
    op: UnaryOp,
    dst: &'d Tensor<B>,
    src: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    check_dst(op.name(), dst, src.shape(), src.dtype())?;
    let src = Source::new(op.name(), dst, src, src.layout().clone())?;
    tracing::trace!(op = op.name(), shape = %dst.shape(), "unary");
    let guard = src.lock()?;
    let mut d = dst.write_storage()?;
    B::unary_to(op, &mut d, dst.layout(), src.operand(&guard))?;
    Ok(dst)
}

/// `dst = src * mul + add`. Safe in place.
pub fn affine_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    src: &Tensor<B>,
    mul: f64,
    add: f64,
) -> Result<&'d Tensor<B>> {
    check_dst("affine", dst, src.shape(), src.dtype())?;
    let src = Source::new("affine", dst, src, src.layout().clone())?;
    let guard = src.lock()?;
    let mut d = dst.write_storage()?;
    B::affine_to(&mut d, dst.layout(), src.operand(&guard), mul, add)?;
    Ok(dst)
}

/// `dst = lhs op rhs` with broadcasting. `dst` must have the broadcast
/// shape exactly. Safe in place for an operand that is not broadcast.
pub fn binary_to<'d, B: Backend>(
    op: BinaryOp,
    dst: &'d Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    let name = op.name();
    let b = Broadcast::resolve(lhs.shape(), rhs.shape()).map_err(|_| Error::ShapeMismatch {
        op: name,
        lhs: lhs.shape().clone(),
        rhs: rhs.shape().clone(),
    })?;
    check_same_dtype(name, lhs.dtype(), rhs.dtype())?;
    check_dst(name, dst, &b.shape, lhs.dtype())?;
    let lhs = Source::new(name, dst, lhs, lhs.layout().broadcast_as(&b.shape)?)?;
    let rhs = Source::new(name, dst, rhs, rhs.layout().broadcast_as(&b.shape)?)?;
    tracing::trace!(op = name, shape = %b.shape, "binary");
    let lg = lhs.lock()?;
    let rg = rhs.lock()?;
    let mut d = dst.write_storage()?;
    B::binary_to(
        op,
        &mut d,
        dst.layout(),
        lhs.operand(&lg),
        rhs.operand(&rg),
    )?;
    Ok(dst)
}

pub fn add_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    binary_to(BinaryOp::Add, dst, lhs, rhs)
}

pub fn sub_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    binary_to(BinaryOp::Sub, dst, lhs, rhs)
}

pub fn mul_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    binary_to(BinaryOp::Mul, dst, lhs, rhs)
}

pub fn div_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    binary_to(BinaryOp::Div, dst, lhs, rhs)
}

/// `dst = dst op rhs`, with `rhs` broadcast to the shape of `dst`.
///
/// Used for bias addition and gradient accumulation.
pub fn binary_assign<'d, B: Backend>(
    op: BinaryOp,
    dst: &'d Tensor<B>,
    rhs: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    let name = op.name();
    if !Broadcast::expands_to(rhs.shape(), dst.shape()) {
        return Err(Error::ShapeMismatch {
            op: name,
            lhs: dst.shape().clone(),
            rhs: rhs.shape().clone(),
        });
    }
    check_dst(name, dst, dst.shape(), rhs.dtype())?;
    let rhs = Source::new(name, dst, rhs, rhs.layout().broadcast_as(dst.shape())?)?;
    let rg = rhs.lock()?;
    let mut d = dst.write_storage()?;
    B::binary_to(
        op,
        &mut d,
        dst.layout(),
        Operand::Destination,
        rhs.operand(&rg),
    )?;
    Ok(dst)
}

/// `dst = (src op rhs) ? 1 : 0` into a U8 mask.
pub fn cmp_scalar_to<'d, B: Backend>(
    op: CmpOp,
    dst: &'d Tensor<B>,
    src: &Tensor<B>,
    rhs: f64,
) -> Result<&'d Tensor<B>> {
    check_dst("cmp", dst, src.shape(), DType::U8)?;
    if src.shares_storage(dst) {
        return Err(Error::invalid_destination("cmp", "mask aliases its source"));
    }
    let s = src.read_storage()?;
    let mut d = dst.write_storage()?;
    B::cmp_scalar_to(op, &mut d, dst.layout(), &s, src.layout(), rhs)?;
    Ok(dst)
}

/// The mask `src > 0` captured by a ReLU forward pass.
pub fn relu_mask_to<'d, B: Backend>(dst: &'d Tensor<B>, src: &Tensor<B>) -> Result<&'d Tensor<B>> {
    cmp_scalar_to(CmpOp::Gt, dst, src, 0.0)
}
