// Activation layers
//
// Each backward pass is a single fused kernel over state kept from forward:
//
//   ReLU      mask m = (x > 0) as U8     dx = g * m
//   Sigmoid   output y                   dx = g * y * (1 - y)
//   Tanh      output y                   dx = g * (1 - y²)
//   Softmax   output y along `dim`       dx = y * (g - Σ_dim(g * y))

use marten_core::backend::{Backend, UnaryOp};
use marten_core::dtype::DType;
use marten_core::error::Result;
use marten_core::ops;
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;
use marten_core::{BufferId, BufferRole, Error};

use crate::layer::{initialised, Layer, LayerBuffers};

#[derive(Clone, Copy)]
struct ActBuffers {
    output: BufferId,
    input_grad: BufferId,
    mask: Option<BufferId>,
}

struct ActState<B: Backend> {
    dtype: DType,
    device: B::Device,
    buffers: LayerBuffers<B>,
    ids: Option<ActBuffers>,
}

impl<B: Backend> ActState<B> {
    fn new(name: &str, dtype: DType, device: &B::Device) -> Self {
        ActState {
            dtype,
            device: device.clone(),
            buffers: LayerBuffers::new(name),
            ids: None,
        }
    }

    fn alloc(&mut self, shape: &Shape, with_mask: bool) -> Result<()> {
        self.ids = None;
        let (dtype, device) = (self.dtype, self.device.clone());
        let arena = self.buffers.reopen();
        let ids = ActBuffers {
            output: arena.alloc(BufferRole::Output, shape, dtype, &device)?,
            input_grad: arena.alloc(BufferRole::InputGrad, shape, dtype, &device)?,
            mask: if with_mask {
                Some(arena.alloc(BufferRole::Scratch("mask"), shape, DType::U8, &device)?)
            } else {
                None
            },
        };
        self.buffers.seal(shape, shape);
        self.ids = Some(ids);
        Ok(())
    }

    fn forward_ids(&self, op: &'static str, x: &Tensor<B>) -> Result<ActBuffers> {
        self.buffers.check_input(op, x)?;
        initialised(&self.ids, op)
    }

    fn backward_ids(&self, op: &'static str, grad_out: &Tensor<B>) -> Result<ActBuffers> {
        self.buffers.check_backward(op, grad_out)?;
        initialised(&self.ids, op)
    }
}

/// Rectified linear unit.
pub struct ReLU<B: Backend> {
    state: ActState<B>,
}

impl<B: Backend> ReLU<B> {
    pub fn new(dtype: DType, device: &B::Device) -> Self {
        ReLU {
            state: ActState::new("relu", dtype, device),
        }
    }
}

impl<B: Backend> Layer<B> for ReLU<B> {
    fn name(&self) -> &str {
        "relu"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        Ok(input_shape.clone())
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        self.state.alloc(input_shape, true)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let op = "relu.forward";
        let ids = self.state.forward_ids(op, x)?;
        let mask = ids
            .mask
            .ok_or_else(|| Error::missing_state(op, "mask buffer"))?;
        ops::relu_mask_to(&self.state.buffers.get(mask)?, x)?;
        let out = self.state.buffers.get(ids.output)?;
        ops::unary_to(UnaryOp::Relu, &out, x)?;
        self.state.buffers.mark_forward();
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let op = "relu.backward";
        let ids = self.state.backward_ids(op, grad_out)?;
        let mask = ids
            .mask
            .ok_or_else(|| Error::missing_state(op, "mask buffer"))?;
        let dx = self.state.buffers.get(ids.input_grad)?;
        ops::relu_grad_masked_to(&dx, grad_out, &self.state.buffers.get(mask)?)?;
        Ok(dx)
    }
}

/// Logistic sigmoid.
pub struct Sigmoid<B: Backend> {
    state: ActState<B>,
}

impl<B: Backend> Sigmoid<B> {
    pub fn new(dtype: DType, device: &B::Device) -> Self {
        Sigmoid {
            state: ActState::new("sigmoid", dtype, device),
        }
    }
}

impl<B: Backend> Layer<B> for Sigmoid<B> {
    fn name(&self) -> &str {
        "sigmoid"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        Ok(input_shape.clone())
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        self.state.alloc(input_shape, false)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let ids = self.state.forward_ids("sigmoid.forward", x)?;
        let out = self.state.buffers.get(ids.output)?;
        ops::unary_to(UnaryOp::Sigmoid, &out, x)?;
        self.state.buffers.mark_forward();
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let ids = self.state.backward_ids("sigmoid.backward", grad_out)?;
        let dx = self.state.buffers.get(ids.input_grad)?;
        ops::sigmoid_grad_to(&dx, grad_out, &self.state.buffers.get(ids.output)?)?;
        Ok(dx)
    }
}

/// Hyperbolic tangent.
pub struct Tanh<B: Backend> {
    state: ActState<B>,
}

impl<B: Backend> Tanh<B> {
    pub fn new(dtype: DType, device: &B::Device) -> Self {
        Tanh {
            state: ActState::new("tanh", dtype, device),
        }
    }
}

impl<B: Backend> Layer<B> for Tanh<B> {
    fn name(&self) -> &str {
        "tanh"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        Ok(input_shape.clone())
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        self.state.alloc(input_shape, false)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let ids = self.state.forward_ids("tanh.forward", x)?;
        let out = self.state.buffers.get(ids.output)?;
        ops::unary_to(UnaryOp::Tanh, &out, x)?;
        self.state.buffers.mark_forward();
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let ids = self.state.backward_ids("tanh.backward", grad_out)?;
        let dx = self.state.buffers.get(ids.input_grad)?;
        ops::tanh_grad_to(&dx, grad_out, &self.state.buffers.get(ids.output)?)?;
        Ok(dx)
    }
}

/// Softmax along one dimension.
pub struct Softmax<B: Backend> {
    dim: usize,
    state: ActState<B>,
}

impl<B: Backend> Softmax<B> {
    pub fn new(dim: usize, dtype: DType, device: &B::Device) -> Self {
        Softmax {
            dim,
            state: ActState::new("softmax", dtype, device),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl<B: Backend> Layer<B> for Softmax<B> {
    fn name(&self) -> &str {
        "softmax"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        input_shape.dim(self.dim)?;
        Ok(input_shape.clone())
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        input_shape.dim(self.dim)?;
        self.state.alloc(input_shape, false)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let ids = self.state.forward_ids("softmax.forward", x)?;
        let out = self.state.buffers.get(ids.output)?;
        ops::softmax_to(&out, x, self.dim)?;
        self.state.buffers.mark_forward();
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let ids = self.state.backward_ids("softmax.backward", grad_out)?;
        let dx = self.state.buffers.get(ids.input_grad)?;
        ops::softmax_grad_to(&dx, grad_out, &self.state.buffers.get(ids.output)?, self.dim)?;
        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_cpu::{CpuBackend, CpuDevice, CpuTensor};

    fn t(data: &[f64], shape: impl Into<Shape>) -> CpuTensor {
        CpuTensor::from_f64_slice(data, shape, DType::F64, &CpuDevice).unwrap()
    }

    #[test]
    fn relu_routes_through_mask() {
        let mut relu = ReLU::<CpuBackend>::new(DType::F64, &CpuDevice);
        relu.init(&Shape::from(4)).unwrap();
        let y = relu.forward(&t(&[-1., 2., 0., 3.], 4)).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), vec![0., 2., 0., 3.]);
        let dx = relu.backward(&t(&[5., 5., 5., 5.], 4)).unwrap();
        assert_eq!(dx.to_f64_vec().unwrap(), vec![0., 5., 0., 5.]);
    }

    #[test]
    fn sigmoid_gradient_at_zero() {
        let mut s = Sigmoid::<CpuBackend>::new(DType::F64, &CpuDevice);
        s.init(&Shape::from(1)).unwrap();
        s.forward(&t(&[0.0], 1)).unwrap();
        let dx = s.backward(&t(&[1.0], 1)).unwrap();
        assert!((dx.to_scalar_f64().unwrap() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn tanh_gradient_at_zero() {
        let mut s = Tanh::<CpuBackend>::new(DType::F64, &CpuDevice);
        s.init(&Shape::from(2)).unwrap();
        s.forward(&t(&[0.0, 0.0], 2)).unwrap();
        let dx = s.backward(&t(&[3.0, -1.0], 2)).unwrap();
        assert_eq!(dx.to_f64_vec().unwrap(), vec![3.0, -1.0]);
    }

    #[test]
    fn softmax_gradient_of_uniform_upstream_is_zero() {
        let mut s = Softmax::<CpuBackend>::new(1, DType::F64, &CpuDevice);
        s.init(&Shape::from((2, 3))).unwrap();
        s.forward(&t(&[1., 2., 3., -1., 0., 4.], (2, 3))).unwrap();
        let dx = s.backward(&t(&[1.0; 6], (2, 3))).unwrap();
        assert!(dx.to_f64_vec().unwrap().iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn softmax_dim_out_of_range() {
        let mut s = Softmax::<CpuBackend>::new(2, DType::F64, &CpuDevice);
        assert!(s.init(&Shape::from((2, 3))).is_err());
    }
}
