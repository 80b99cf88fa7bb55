// Losses
//
// Mean squared error:
//
//   loss = Σ (pred - target)² / n
//   dloss/dpred = 2 (pred - target) / n
//
// Cross-entropy over probabilities, summed over every element:
//
//   loss = -Σ target * ln(pred + ε)         terms with target = 0 or pred <= 0 skipped
//   dloss/dpred = -target / (pred + ε)      0 where pred <= 0
//
// Categorical cross-entropy is the same loss over the last dimension. With
// `from_logits` the prediction is passed through a softmax over that
// dimension first and the gradient with respect to the logits is the
// familiar softmax(pred) - target.
//
// `pred` and `target` must have identical shapes; no broadcasting.

use marten_core::backend::{Backend, CmpOp};
use marten_core::dtype::DType;
use marten_core::error::{Error, Result};
use marten_core::ops;
use marten_core::tensor::Tensor;

/// Added to probabilities before taking the log or dividing by them.
pub const CROSS_ENTROPY_EPS: f64 = 1e-10;

fn check_pair<B: Backend>(op: &'static str, pred: &Tensor<B>, target: &Tensor<B>) -> Result<()> {
    if pred.shape() != target.shape() {
        return Err(Error::ShapeMismatch {
            op,
            lhs: pred.shape().clone(),
            rhs: target.shape().clone(),
        });
    }
    Ok(())
}

/// Mean squared error as a scalar. Zero for empty tensors.
pub fn mse_loss<B: Backend>(pred: &Tensor<B>, target: &Tensor<B>) -> Result<f64> {
    check_pair("mse_loss", pred, target)?;
    let n = pred.elem_count();
    if n == 0 {
        return Ok(0.0);
    }
    let total = pred.sub(target)?.square()?.sum_all()?.to_scalar_f64()?;
    Ok(total / n as f64)
}

/// Write the gradient of [`mse_loss`] with respect to `pred` into `dst`.
pub fn mse_grad_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    pred: &Tensor<B>,
    target: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    check_pair("mse_grad", pred, target)?;
    let n = pred.elem_count().max(1) as f64;
    ops::sub_to(dst, pred, target)?;
    ops::affine_to(dst, dst, 2.0 / n, 0.0)
}

fn check_classes<B: Backend>(op: &'static str, pred: &Tensor<B>, target: &Tensor<B>) -> Result<usize> {
    check_pair(op, pred, target)?;
    match pred.rank() {
        0 => Err(Error::unsupported(op, "a scalar prediction has no class dimension")),
        rank => Ok(rank - 1),
    }
}

fn cross_entropy_sum(pred: &[f64], target: &[f64]) -> f64 {
    pred.iter()
        .zip(target)
        .filter(|&(&p, &t)| t != 0.0 && p > 0.0)
        .map(|(&p, &t)| -t * (p + CROSS_ENTROPY_EPS).ln())
        .sum()
}

/// Cross-entropy of the probabilities `pred` against `target`, summed over
/// every element.
pub fn cross_entropy_loss<B: Backend>(pred: &Tensor<B>, target: &Tensor<B>) -> Result<f64> {
    check_classes("cross_entropy_loss", pred, target)?;
    Ok(cross_entropy_sum(&pred.to_f64_vec()?, &target.to_f64_vec()?))
}

/// Write the gradient of [`cross_entropy_loss`] with respect to `pred` into
/// `dst`.
pub fn cross_entropy_grad_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    pred: &Tensor<B>,
    target: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    let op = "cross_entropy_grad";
    check_classes(op, pred, target)?;
    if dst.shares_storage(pred) || dst.shares_storage(target) {
        return Err(Error::invalid_destination(
            op,
            "destination aliases an operand",
        ));
    }
    let positive = Tensor::zeros(pred.shape().clone(), DType::U8, pred.device())?;
    ops::cmp_scalar_to(CmpOp::Gt, &positive, pred, 0.0)?;
    ops::affine_to(dst, pred, 1.0, CROSS_ENTROPY_EPS)?;
    ops::div_to(dst, target, dst)?;
    ops::affine_to(dst, dst, -1.0, 0.0)?;
    ops::relu_grad_masked_to(dst, dst, &positive)
}

/// Categorical cross-entropy with classes along the last dimension.
pub fn categorical_cross_entropy_loss<B: Backend>(
    pred: &Tensor<B>,
    target: &Tensor<B>,
    from_logits: bool,
) -> Result<f64> {
    let classes = check_classes("categorical_cross_entropy_loss", pred, target)?;
    let probs = if from_logits {
        pred.softmax(classes)?
    } else {
        pred.clone()
    };
    Ok(cross_entropy_sum(&probs.to_f64_vec()?, &target.to_f64_vec()?))
}

/// Write the gradient of [`categorical_cross_entropy_loss`] with respect
/// to `pred` (the logits when `from_logits`) into `dst`.
pub fn categorical_cross_entropy_grad_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    pred: &Tensor<B>,
    target: &Tensor<B>,
    from_logits: bool,
) -> Result<&'d Tensor<B>> {
    let op = "categorical_cross_entropy_grad";
    let classes = check_classes(op, pred, target)?;
    if !from_logits {
        return cross_entropy_grad_to(dst, pred, target);
    }
    if dst.shares_storage(target) {
        return Err(Error::invalid_destination(op, "destination aliases the target"));
    }
    ops::softmax_to(dst, pred, classes)?;
    ops::sub_to(dst, dst, target)
}
