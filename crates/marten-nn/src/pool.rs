// Pooling layers
//
//   MaxPool2d          [N, C, H, W] -> [N, C, H_out, W_out], records indices
//   AvgPool2d          [N, C, H, W] -> [N, C, H_out, W_out]
//   GlobalAvgPool2d    [N, C, H, W] -> [N, C]
//   AdaptiveAvgPool2d  [N, C, H, W] -> [N, C, oH, oW]
//
// MaxPool2d owns its `PoolIndices`; every forward re-records them and the
// backward pass checks they were recorded for the current input shape.

use marten_core::backend::Backend;
use marten_core::dtype::DType;
use marten_core::error::{Error, Result};
use marten_core::ops::{self, PoolIndices};
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;
use marten_core::window::{Geometry2d, Window2d};
use marten_core::{BufferId, BufferRole};

use crate::layer::{expect_rank, initialised, Layer, LayerBuffers};

#[derive(Clone, Copy)]
struct PoolBuffers {
    output: BufferId,
    input_grad: BufferId,
}

/// Output and input-gradient buffers of a parameter-free spatial layer.
struct PoolState<B: Backend> {
    dtype: DType,
    device: B::Device,
    buffers: LayerBuffers<B>,
    ids: Option<PoolBuffers>,
}

impl<B: Backend> PoolState<B> {
    fn new(name: &str, dtype: DType, device: &B::Device) -> Self {
        PoolState {
            dtype,
            device: device.clone(),
            buffers: LayerBuffers::new(name),
            ids: None,
        }
    }

    fn alloc(&mut self, input_shape: &Shape, output_shape: &Shape) -> Result<()> {
        self.ids = None;
        let (dtype, device) = (self.dtype, self.device.clone());
        let arena = self.buffers.reopen();
        let ids = PoolBuffers {
            output: arena.alloc(BufferRole::Output, output_shape, dtype, &device)?,
            input_grad: arena.alloc(BufferRole::InputGrad, input_shape, dtype, &device)?,
        };
        self.buffers.seal(input_shape, output_shape);
        self.ids = Some(ids);
        Ok(())
    }

    /// Validated output buffer for a forward call.
    fn output(&self, op: &'static str, x: &Tensor<B>) -> Result<Tensor<B>> {
        self.buffers.check_input(op, x)?;
        self.buffers.get(initialised(&self.ids, op)?.output)
    }

    /// Validated input-gradient buffer for a backward call.
    fn input_grad(&self, op: &'static str, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        self.buffers.check_backward(op, grad_out)?;
        self.buffers.get(initialised(&self.ids, op)?.input_grad)
    }
}

fn pooled_shape(op: &'static str, input_shape: &Shape, window: &Window2d) -> Result<Shape> {
    expect_rank(op, input_shape, 4)?;
    window.check_pooling()?;
    let geom = Geometry2d::resolve(input_shape, *window)?;
    Ok(geom.output_shape(geom.channels))
}

/// 2-D max pooling.
pub struct MaxPool2d<B: Backend> {
    window: Window2d,
    state: PoolState<B>,
    indices: Option<PoolIndices<B>>,
}

impl<B: Backend> MaxPool2d<B> {
    pub fn new(
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let window = Window2d::new(kernel_size, stride, padding)?;
        window.check_pooling()?;
        Ok(MaxPool2d {
            window,
            state: PoolState::new("max_pool2d", dtype, device),
            indices: None,
        })
    }

    /// The recorded indices, once initialised.
    pub fn indices(&self) -> Option<&PoolIndices<B>> {
        self.indices.as_ref()
    }
}

impl<B: Backend> Layer<B> for MaxPool2d<B> {
    fn name(&self) -> &str {
        "max_pool2d"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        pooled_shape("max_pool2d", input_shape, &self.window)
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let output_shape = pooled_shape("max_pool2d.init", input_shape, &self.window)?;
        self.indices = None;
        self.state.alloc(input_shape, &output_shape)?;
        self.indices = Some(PoolIndices::new(output_shape, &self.state.device)?);
        Ok(())
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let op = "max_pool2d.forward";
        let out = self.state.output(op, x)?;
        let indices = self
            .indices
            .as_mut()
            .ok_or_else(|| Error::missing_state(op, "layer has not been initialised"))?;
        ops::max_pool2d_to(&out, indices, x, &self.window)?;
        self.state.buffers.mark_forward();
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let op = "max_pool2d.backward";
        let dx = self.state.input_grad(op, grad_out)?;
        let indices = self
            .indices
            .as_ref()
            .ok_or_else(|| Error::missing_state(op, "layer has not been initialised"))?;
        ops::max_pool2d_backward_to(&dx, grad_out, indices, &self.window)?;
        Ok(dx)
    }
}

/// 2-D average pooling; padding positions are left out of every mean.
pub struct AvgPool2d<B: Backend> {
    window: Window2d,
    state: PoolState<B>,
}

impl<B: Backend> AvgPool2d<B> {
    pub fn new(
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let window = Window2d::new(kernel_size, stride, padding)?;
        window.check_pooling()?;
        Ok(AvgPool2d {
            window,
            state: PoolState::new("avg_pool2d", dtype, device),
        })
    }
}

impl<B: Backend> Layer<B> for AvgPool2d<B> {
    fn name(&self) -> &str {
        "avg_pool2d"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        pooled_shape("avg_pool2d", input_shape, &self.window)
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let output_shape = pooled_shape("avg_pool2d.init", input_shape, &self.window)?;
        self.state.alloc(input_shape, &output_shape)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let out = self.state.output("avg_pool2d.forward", x)?;
        ops::avg_pool2d_to(&out, x, &self.window)?;
        self.state.buffers.mark_forward();
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let dx = self.state.input_grad("avg_pool2d.backward", grad_out)?;
        ops::avg_pool2d_backward_to(&dx, grad_out, &self.window)?;
        Ok(dx)
    }
}

/// Mean over all spatial positions: `[N, C, H, W] -> [N, C]`.
pub struct GlobalAvgPool2d<B: Backend> {
    state: PoolState<B>,
}

impl<B: Backend> GlobalAvgPool2d<B> {
    pub fn new(dtype: DType, device: &B::Device) -> Self {
        GlobalAvgPool2d {
            state: PoolState::new("global_avg_pool2d", dtype, device),
        }
    }
}

impl<B: Backend> Layer<B> for GlobalAvgPool2d<B> {
    fn name(&self) -> &str {
        "global_avg_pool2d"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        expect_rank("global_avg_pool2d", input_shape, 4)?;
        let d = input_shape.dims();
        Ok(Shape::from((d[0], d[1])))
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let output_shape = self.output_shape(input_shape)?;
        self.state.alloc(input_shape, &output_shape)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let out = self.state.output("global_avg_pool2d.forward", x)?;
        ops::global_avg_pool2d_to(&out, x)?;
        self.state.buffers.mark_forward();
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let dx = self.state.input_grad("global_avg_pool2d.backward", grad_out)?;
        ops::global_avg_pool2d_backward_to(&dx, grad_out)?;
        Ok(dx)
    }
}

/// Average pooling to a fixed output size, whatever the input size.
pub struct AdaptiveAvgPool2d<B: Backend> {
    output_size: [usize; 2],
    state: PoolState<B>,
}

impl<B: Backend> AdaptiveAvgPool2d<B> {
    pub fn new(output_size: [usize; 2], dtype: DType, device: &B::Device) -> Result<Self> {
        if output_size.contains(&0) {
            return Err(Error::unsupported(
                "adaptive_avg_pool2d",
                format!("output size must be >= 1, got {:?}", output_size),
            ));
        }
        Ok(AdaptiveAvgPool2d {
            output_size,
            state: PoolState::new("adaptive_avg_pool2d", dtype, device),
        })
    }
}

impl<B: Backend> Layer<B> for AdaptiveAvgPool2d<B> {
    fn name(&self) -> &str {
        "adaptive_avg_pool2d"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        expect_rank("adaptive_avg_pool2d", input_shape, 4)?;
        let d = input_shape.dims();
        Ok(Shape::from((d[0], d[1], self.output_size[0], self.output_size[1])))
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let output_shape = self.output_shape(input_shape)?;
        self.state.alloc(input_shape, &output_shape)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let out = self.state.output("adaptive_avg_pool2d.forward", x)?;
        ops::adaptive_avg_pool2d_to(&out, x)?;
        self.state.buffers.mark_forward();
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let dx = self.state.input_grad("adaptive_avg_pool2d.backward", grad_out)?;
        ops::adaptive_avg_pool2d_backward_to(&dx, grad_out)?;
        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::ErrorKind;
    use marten_cpu::{CpuBackend, CpuDevice, CpuTensor};

    fn t(data: &[f64], shape: impl Into<Shape>) -> CpuTensor {
        CpuTensor::from_f64_slice(data, shape, DType::F64, &CpuDevice).unwrap()
    }

    #[test]
    fn max_pool_layer_round_trip() {
        let mut pool =
            MaxPool2d::<CpuBackend>::new([2, 2], [2, 2], [0, 0], DType::F64, &CpuDevice).unwrap();
        pool.init(&Shape::from((1, 1, 2, 4))).unwrap();
        let x = t(&[1., 3., 8., 2., 4., 0., 6., 7.], (1, 1, 2, 4));
        let y = pool.forward(&x).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), vec![4., 8.]);
        let dx = pool.backward(&t(&[1., 2.], (1, 1, 1, 2))).unwrap();
        assert_eq!(dx.to_f64_vec().unwrap(), vec![0., 0., 2., 0., 1., 0., 0., 0.]);
    }

    #[test]
    fn backward_before_forward() {
        let mut pool =
            AvgPool2d::<CpuBackend>::new([2, 2], [2, 2], [0, 0], DType::F64, &CpuDevice).unwrap();
        pool.init(&Shape::from((1, 1, 2, 2))).unwrap();
        let err = pool.backward(&t(&[1.], (1, 1, 1, 1))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingPrecomputedState);
    }

    #[test]
    fn global_average_fixture() {
        let mut pool = GlobalAvgPool2d::<CpuBackend>::new(DType::F64, &CpuDevice);
        pool.init(&Shape::from((1, 1, 2, 2))).unwrap();
        let y = pool.forward(&t(&[1., 2., 3., 4.], (1, 1, 2, 2))).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), vec![2.5]);
        let dx = pool.backward(&t(&[2.0], (1, 1))).unwrap();
        assert_eq!(dx.to_f64_vec().unwrap(), vec![0.5; 4]);
    }

    #[test]
    fn adaptive_output_size() {
        let mut pool =
            AdaptiveAvgPool2d::<CpuBackend>::new([1, 2], DType::F64, &CpuDevice).unwrap();
        let input = Shape::from((2, 3, 5, 6));
        assert_eq!(pool.output_shape(&input).unwrap(), Shape::from((2, 3, 1, 2)));
        pool.init(&input).unwrap();
        let x = CpuTensor::ones(input, DType::F64, &CpuDevice).unwrap();
        let y = pool.forward(&x).unwrap();
        assert!(y.to_f64_vec().unwrap().iter().all(|&v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn padding_only_windows_are_unsupported() {
        let err = MaxPool2d::<CpuBackend>::new([2, 2], [1, 1], [2, 2], DType::F64, &CpuDevice)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::UnsupportedConfiguration);
    }
}
