// Flatten — collapse a contiguous range of dimensions into one
//
//   Flatten::new               [N, d1, d2, ...] -> [N, d1*d2*...]
//   Flatten::range(1, 3)       [N, C, H, W]     -> [N, C*H, W]
//   Flatten::range(0, rank)    [N, C, H, W]     -> [N*C*H*W]
//
// `range(start, end)` collapses dims `start..end`; an empty range inserts a
// dimension of size 1 at `start`. The result is copied into the layer's own
// output buffer rather than returned as a view of the input, so a later
// write to the caller's tensor cannot change what the next layer saw.

use marten_core::backend::Backend;
use marten_core::dtype::DType;
use marten_core::error::{Error, Result};
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;

use crate::layer::Layer;
use crate::reshape::Relayout;

/// Collapses dims `start..end` (by default every dimension after the
/// batch dimension).
pub struct Flatten<B: Backend> {
    start: usize,
    end: Option<usize>,
    inner: Relayout<B>,
}

impl<B: Backend> Flatten<B> {
    pub fn new(dtype: DType, device: &B::Device) -> Self {
        Flatten {
            start: 1,
            end: None,
            inner: Relayout::new("flatten", dtype, device),
        }
    }

    /// Collapse dims `start..end`.
    pub fn range(start: usize, end: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        if start > end {
            return Err(Error::unsupported(
                "flatten",
                format!("empty dim range {start}..{end}"),
            ));
        }
        Ok(Flatten {
            start,
            end: Some(end),
            inner: Relayout::new("flatten", dtype, device),
        })
    }
}

impl<B: Backend> Layer<B> for Flatten<B> {
    fn name(&self) -> &str {
        "flatten"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        let dims = input_shape.dims();
        let end = self.end.unwrap_or(dims.len());
        if self.start > end || end > dims.len() {
            return Err(Error::unsupported(
                "flatten",
                format!("cannot flatten dims {}..{end} of {input_shape}", self.start),
            ));
        }
        let mut out = dims[..self.start].to_vec();
        out.push(dims[self.start..end].iter().product());
        out.extend_from_slice(&dims[end..]);
        Ok(Shape::new(out))
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let output_shape = self.output_shape(input_shape)?;
        self.inner.init(input_shape, &output_shape)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        self.inner
            .forward("flatten.forward", x, |out| out.reshape(x.shape()))
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        self.inner
            .backward("flatten.backward", grad_out, |dx| dx.reshape(grad_out.shape()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::ErrorKind;
    use marten_cpu::{CpuBackend, CpuDevice, CpuTensor};

    #[test]
    fn flattens_and_restores() {
        let mut f = Flatten::<CpuBackend>::new(DType::F64, &CpuDevice);
        let input = Shape::from((2, 3, 2, 2));
        assert_eq!(f.output_shape(&input).unwrap(), Shape::from((2, 12)));
        f.init(&input).unwrap();
        let data: Vec<f64> = (0..24).map(|i| i as f64).collect();
        let x = CpuTensor::from_f64_slice(&data, input.clone(), DType::F64, &CpuDevice).unwrap();
        let y = f.forward(&x).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), data);
        let dx = f.backward(&y).unwrap();
        assert_eq!(dx.shape(), &input);
        assert_eq!(dx.to_f64_vec().unwrap(), data);
    }

    #[test]
    fn strided_input_is_copied_in_logical_order() {
        let mut f = Flatten::<CpuBackend>::new(DType::F64, &CpuDevice);
        f.init(&Shape::from((2, 2))).unwrap();
        let x = CpuTensor::from_f64_slice(&[1., 2., 3., 4.], (2, 2), DType::F64, &CpuDevice)
            .unwrap()
            .t()
            .unwrap();
        let y = f.forward(&x).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), vec![1., 3., 2., 4.]);
    }

    #[test]
    fn dim_ranges() {
        let input = Shape::from((2, 3, 4, 5));
        let middle = Flatten::<CpuBackend>::range(1, 3, DType::F64, &CpuDevice).unwrap();
        assert_eq!(middle.output_shape(&input).unwrap(), Shape::from((2, 12, 5)));
        let all = Flatten::<CpuBackend>::range(0, 4, DType::F64, &CpuDevice).unwrap();
        assert_eq!(all.output_shape(&input).unwrap(), Shape::from(120));
        let empty = Flatten::<CpuBackend>::range(2, 2, DType::F64, &CpuDevice).unwrap();
        assert_eq!(empty.output_shape(&input).unwrap(), Shape::from(vec![2, 3, 1, 4, 5]));

        let past_end = Flatten::<CpuBackend>::range(1, 5, DType::F64, &CpuDevice).unwrap();
        assert_eq!(
            past_end.output_shape(&input).unwrap_err().kind(),
            ErrorKind::UnsupportedConfiguration
        );
        assert!(Flatten::<CpuBackend>::range(3, 1, DType::F64, &CpuDevice).is_err());
    }

    #[test]
    fn rank_one_input_gains_a_feature_axis() {
        let f = Flatten::<CpuBackend>::new(DType::F64, &CpuDevice);
        assert_eq!(f.output_shape(&Shape::from(4)).unwrap(), Shape::from((4, 1)));
        assert!(f.output_shape(&Shape::from(())).is_err());
    }
}
