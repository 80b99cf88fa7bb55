// Parameter initialisation
//
//   uniform(shape, low, high)          U(low, high)
//   kaiming_uniform(shape, a, mode)    U(-bound, bound),
//                                      bound = gain * sqrt(3 / fan),
//                                      gain  = sqrt(2 / (1 + a²))
//
// With a = sqrt(5) the bound reduces to 1/sqrt(fan_in), which is what the
// dense and convolution layers use for their weights. Biases draw from
// U(-1/sqrt(fan_in), 1/sqrt(fan_in)).

use marten_core::backend::Backend;
use marten_core::dtype::DType;
use marten_core::error::Result;
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;

/// Which fan Kaiming initialisation scales by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    /// Input features; preserves variance in the forward pass.
    FanIn,
    /// Output features; preserves variance in the backward pass.
    FanOut,
}

/// `(fan_in, fan_out)` of a weight shape.
///
/// - 1-D: both are `dims[0]`
/// - 2-D `[out, in]`: `(in, out)`
/// - 3-D and up `[C_out, C_in, k..]`: `(C_in * Πk, C_out * Πk)`
pub fn compute_fans(shape: &Shape) -> (f64, f64) {
    let dims = shape.dims();
    match dims.len() {
        0 => (1.0, 1.0),
        1 => (dims[0] as f64, dims[0] as f64),
        2 => (dims[1] as f64, dims[0] as f64),
        _ => {
            let receptive: usize = dims[2..].iter().product();
            (
                (dims[1] * receptive) as f64,
                (dims[0] * receptive) as f64,
            )
        }
    }
}

/// A tensor drawn from U(low, high).
pub fn uniform<B: Backend>(
    shape: impl Into<Shape>,
    low: f64,
    high: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Tensor::<B>::rand(shape, dtype, device)?.affine(high - low, low)
}

/// Kaiming (He) uniform initialisation.
pub fn kaiming_uniform<B: Backend>(
    shape: impl Into<Shape>,
    a: f64,
    mode: FanMode,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let shape = shape.into();
    let (fan_in, fan_out) = compute_fans(&shape);
    let fan = match mode {
        FanMode::FanIn => fan_in,
        FanMode::FanOut => fan_out,
    };
    let gain = (2.0 / (1.0 + a * a)).sqrt();
    let bound = gain * (3.0 / fan.max(1.0)).sqrt();
    uniform::<B>(shape, -bound, bound, dtype, device)
}

/// The weight/bias initialisation shared by dense and convolution layers.
pub(crate) fn default_weight<B: Backend>(
    shape: Shape,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    kaiming_uniform::<B>(shape, 5f64.sqrt(), FanMode::FanIn, dtype, device)
}

pub(crate) fn default_bias<B: Backend>(
    weight_shape: &Shape,
    len: usize,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let (fan_in, _) = compute_fans(weight_shape);
    let bound = 1.0 / fan_in.max(1.0).sqrt();
    uniform::<B>(len, -bound, bound, dtype, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_cpu::{CpuBackend, CpuDevice};

    #[test]
    fn fans_for_dense_and_conv() {
        assert_eq!(compute_fans(&Shape::from((8, 3))), (3.0, 8.0));
        assert_eq!(compute_fans(&Shape::from((4, 2, 3, 3))), (18.0, 36.0));
        assert_eq!(compute_fans(&Shape::from((4, 2, 5))), (10.0, 20.0));
    }

    #[test]
    fn kaiming_uniform_bounds() {
        let t = kaiming_uniform::<CpuBackend>((50, 100), 0.0, FanMode::FanIn, DType::F64, &CpuDevice)
            .unwrap();
        let bound = (6.0 / 100.0f64).sqrt();
        assert!(t.to_f64_vec().unwrap().iter().all(|x| x.abs() <= bound + 1e-12));
    }

    #[test]
    fn uniform_range() {
        let t = uniform::<CpuBackend>(500, -2.0, -1.0, DType::F32, &CpuDevice).unwrap();
        assert!(t.to_f64_vec().unwrap().iter().all(|x| (-2.0..=-1.0).contains(x)));
    }
}
