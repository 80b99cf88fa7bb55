use crate::backend::{Backend, GradOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

use super::{check_dense, check_dst, check_same_dtype, check_same_shape, Source};

// Fused activation gradients
//
//   sigmoid:   dst = g * y * (1 - y)          y = sigmoid output
//   tanh:      dst = g * (1 - y²)             y = tanh output
//   relu:      dst = g * (x > 0)              x = relu input
//   relu mask: dst = g * (m != 0)             m = U8 mask from forward
//   softmax:   dst = y * (g - Σ_d(g * y))     y = softmax output
//
// The first four read one element of each operand per output element, so
// `dst` may be the same buffer as either operand (x = grad_to(x, x) is
// fine). Softmax reads a whole row before writing it and is rejected when
// aliased. No fused kernel broadcasts: every operand has the shape of `dst`.

fn fused<'d, B: Backend>(
    op: GradOp,
    dst: &'d Tensor<B>,
    grad: &Tensor<B>,
    aux: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    let name = op.name();
    check_same_shape(name, grad.shape(), aux.shape())?;
    if op == GradOp::ReluMask {
        check_same_dtype(name, DType::U8, aux.dtype())?;
    } else {
        check_same_dtype(name, grad.dtype(), aux.dtype())?;
    }
    check_dst(name, dst, grad.shape(), grad.dtype())?;
    let grad = Source::new(name, dst, grad, grad.layout().clone())?;
    let aux = Source::new(name, dst, aux, aux.layout().clone())?;
    tracing::trace!(op = name, shape = %dst.shape(), "fused grad");
    let gg = grad.lock()?;
    let ag = aux.lock()?;
    let mut d = dst.write_storage()?;
    B::fused_grad_to(op, &mut d, dst.layout(), grad.operand(&gg), aux.operand(&ag))?;
    Ok(dst)
}

/// `dst = grad_out * output * (1 - output)`.
pub fn sigmoid_grad_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
    output: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    fused(GradOp::Sigmoid, dst, grad_out, output)
}

/// `dst = grad_out * (1 - output²)`.
pub fn tanh_grad_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
    output: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    fused(GradOp::Tanh, dst, grad_out, output)
}

/// `dst = grad_out * (input > 0)`.
pub fn relu_grad_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
    input: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    fused(GradOp::Relu, dst, grad_out, input)
}

/// `dst = grad_out * mask` with the U8 mask captured during forward.
pub fn relu_grad_masked_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
    mask: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    fused(GradOp::ReluMask, dst, grad_out, mask)
}

/// `dst = output * (grad_out - sum_dim(grad_out * output))`.
pub fn softmax_grad_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
    output: &Tensor<B>,
    dim: usize,
) -> Result<&'d Tensor<B>> {
    let name = "softmax_grad";
    if dim >= output.rank() {
        return Err(Error::DimOutOfRange {
            dim,
            rank: output.rank(),
        });
    }
    check_same_shape(name, grad_out.shape(), output.shape())?;
    check_same_dtype(name, grad_out.dtype(), output.dtype())?;
    check_dst(name, dst, output.shape(), output.dtype())?;
    check_dense(name, dst)?;
    if grad_out.shares_storage(dst) || output.shares_storage(dst) {
        return Err(Error::invalid_destination(
            name,
            "softmax gradient cannot run in place",
        ));
    }
    let g = grad_out.read_storage()?;
    let y = output.read_storage()?;
    let mut d = dst.write_storage()?;
    B::softmax_grad_to(
        &mut d,
        dst.layout(),
        &g,
        grad_out.layout(),
        &y,
        output.layout(),
        dim,
    )?;
    Ok(dst)
}
