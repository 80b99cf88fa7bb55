// Sequential — a chain of layers applied one after another
//
//   let mut model = Sequential::new()
//       .add(Dense::new(4, 8, true, DType::F32, &dev)?)
//       .add(ReLU::new(DType::F32, &dev))
//       .add(Dense::new(8, 1, true, DType::F32, &dev)?);
//   model.init(&Shape::from((batch, 4)))?;
//
// `init` walks the chain once, handing each layer the output shape of the
// one before it. `backward` runs the chain in reverse, feeding each layer
// the input gradient of its successor.

use marten_core::backend::Backend;
use marten_core::error::Result;
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;

use crate::layer::Layer;

/// A container that chains layers. Sequential is itself a layer, so it
/// can be nested.
pub struct Sequential<B: Backend> {
    layers: Vec<Box<dyn Layer<B>>>,
}

impl<B: Backend> Sequential<B> {
    pub fn new() -> Self {
        Sequential { layers: Vec::new() }
    }

    /// Add a layer to the end of the chain.
    #[allow(clippy::should_implement_trait)]
    pub fn add<L: Layer<B> + 'static>(mut self, layer: L) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Box<dyn Layer<B>>] {
        &self.layers
    }
}

impl<B: Backend> Default for Sequential<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Layer<B> for Sequential<B> {
    fn name(&self) -> &str {
        "sequential"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        self.layers
            .iter()
            .try_fold(input_shape.clone(), |shape, layer| layer.output_shape(&shape))
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let mut shape = input_shape.clone();
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.init(&shape)?;
            let next = layer.output_shape(&shape)?;
            tracing::debug!(index = i, layer = layer.name(), input = %shape, output = %next, "init");
            shape = next;
        }
        Ok(())
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let mut out = x.clone();
        for layer in self.layers.iter_mut() {
            out = layer.forward(&out)?;
        }
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let mut grad = grad_out.clone();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad)?;
        }
        Ok(grad)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn gradients(&self) -> Vec<Tensor<B>> {
        self.layers.iter().flat_map(|l| l.gradients()).collect()
    }

    fn set_training(&mut self, training: bool) {
        for layer in self.layers.iter_mut() {
            layer.set_training(training);
        }
    }

    fn is_training(&self) -> bool {
        self.layers.iter().any(|l| l.is_training())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ReLU;
    use crate::dense::Dense;
    use crate::flatten::Flatten;
    use marten_core::dtype::DType;
    use marten_core::ErrorKind;
    use marten_cpu::{CpuBackend, CpuDevice, CpuTensor};

    fn t(data: &[f64], shape: impl Into<Shape>) -> CpuTensor {
        CpuTensor::from_f64_slice(data, shape, DType::F64, &CpuDevice).unwrap()
    }

    fn model() -> Sequential<CpuBackend> {
        let w1 = t(&[1., -1., 0.5, 2.], (2, 2));
        let w2 = t(&[1., 1.], (1, 2));
        Sequential::new()
            .add(Flatten::new(DType::F64, &CpuDevice))
            .add(Dense::from_tensors(w1, None).unwrap())
            .add(ReLU::new(DType::F64, &CpuDevice))
            .add(Dense::from_tensors(w2, Some(t(&[0.5], 1))).unwrap())
    }

    #[test]
    fn shapes_propagate_through_init() {
        let mut m = model();
        let input = Shape::from((3, 2, 1));
        assert_eq!(m.output_shape(&input).unwrap(), Shape::from((3, 1)));
        m.init(&input).unwrap();
        assert_eq!(m.len(), 4);
        assert_eq!(m.num_parameters(), 4 + 2 + 1);
        assert_eq!(m.gradients().len(), 3);
    }

    #[test]
    fn forward_then_backward_in_reverse() {
        let mut m = model();
        m.init(&Shape::from((1, 2, 1))).unwrap();
        // hidden = relu([1 - 2, 0.5 + 4]) = [0, 4.5]
        let y = m.forward(&t(&[1., 2.], (1, 2, 1))).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), vec![5.0]);
        // only the second hidden unit is active: dx = w1[1] = [0.5, 2]
        let dx = m.backward(&t(&[1.0], (1, 1))).unwrap();
        assert_eq!(dx.shape(), &Shape::from((1, 2, 1)));
        assert_eq!(dx.to_f64_vec().unwrap(), vec![0.5, 2.0]);
    }

    #[test]
    fn backward_before_forward_fails() {
        let mut m = model();
        m.init(&Shape::from((1, 2, 1))).unwrap();
        let err = m.backward(&t(&[1.0], (1, 1))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingPrecomputedState);
    }
}
