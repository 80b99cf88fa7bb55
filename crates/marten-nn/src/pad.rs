// Pad — constant padding around every dimension
//
//   padding = [[before_0, after_0], [before_1, after_1], ...]
//   out[d] = before_d + in[d] + after_d
//
// Forward fills the output with the pad value, then copies the input into
// the interior window. Backward is the reverse: the input gradient is the
// interior window of the upstream gradient; the gradient reaching the
// padded border is dropped.

use marten_core::backend::Backend;
use marten_core::dtype::DType;
use marten_core::error::Result;
use marten_core::ops;
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;

use crate::layer::{expect_rank, Layer};
use crate::reshape::Relayout;

pub struct Pad<B: Backend> {
    padding: Vec<[usize; 2]>,
    value: f64,
    inner: Relayout<B>,
}

impl<B: Backend> Pad<B> {
    /// One `[before, after]` pair per input dimension, batch included.
    pub fn new(padding: &[[usize; 2]], value: f64, dtype: DType, device: &B::Device) -> Self {
        Pad {
            padding: padding.to_vec(),
            value,
            inner: Relayout::new("pad", dtype, device),
        }
    }

    pub fn padding(&self) -> &[[usize; 2]] {
        &self.padding
    }
}

/// The window of the output-shaped `t` that holds the unpadded values.
fn interior<B: Backend>(t: &Tensor<B>, padding: &[[usize; 2]]) -> Result<Tensor<B>> {
    let mut view = t.clone();
    for (d, &[before, after]) in padding.iter().enumerate() {
        let len = view.dims()[d] - before - after;
        view = view.narrow(d, before, len)?;
    }
    Ok(view)
}

impl<B: Backend> Layer<B> for Pad<B> {
    fn name(&self) -> &str {
        "pad"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        expect_rank("pad", input_shape, self.padding.len())?;
        Ok(Shape::new(
            input_shape
                .dims()
                .iter()
                .zip(&self.padding)
                .map(|(&d, &[before, after])| before + d + after)
                .collect(),
        ))
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let output_shape = self.output_shape(input_shape)?;
        self.inner.init(input_shape, &output_shape)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let (padding, value) = (&self.padding, self.value);
        self.inner.forward_with("pad.forward", x, |out, x| {
            ops::fill(out, value)?;
            ops::copy_to(&interior(out, padding)?, x)?;
            Ok(())
        })
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let padding = &self.padding;
        self.inner.backward_with("pad.backward", grad_out, |dx, grad_out| {
            ops::copy_to(dx, &interior(grad_out, padding)?)?;
            Ok(())
        })
    }
}
