// Conv2d & Conv1d — convolution layers over the patch-matrix engine
//
// PARAMETER SHAPES:
//
//   Conv2d weight: [C_out, C_in, kH, kW]     bias: [C_out]   (optional)
//   Conv1d weight: [C_out, C_in, k]          bias: [C_out]   (optional)
//
// Besides the output and gradient buffers, each layer owns the two patch
// matrices of its geometry (see `ConvWorkspace`), so neither forward nor
// backward allocates.
//
// OUTPUT SIZE:
//
//   H_out = floor((H + 2*padding_h - kernel_h) / stride_h) + 1
//   W_out = floor((W + 2*padding_w - kernel_w) / stride_w) + 1

use marten_core::backend::Backend;
use marten_core::dtype::DType;
use marten_core::error::{Error, Result};
use marten_core::ops::{self, ConvGrads, ConvWorkspace};
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;
use marten_core::window::{Geometry2d, Window2d};
use marten_core::{BufferId, BufferRole};

use crate::init;
use crate::layer::{expect_rank, initialised, Layer, LayerBuffers};

#[derive(Clone, Copy)]
struct ConvBuffers {
    output: BufferId,
    input_grad: BufferId,
    kernel_grad: BufferId,
    bias_grad: Option<BufferId>,
    columns: BufferId,
    rows: BufferId,
}

/// Parameters, buffers and cached input common to both layers.
struct ConvState<B: Backend> {
    weight: Tensor<B>,
    bias: Option<Tensor<B>>,
    window: Window2d,
    buffers: LayerBuffers<B>,
    ids: Option<ConvBuffers>,
    input: Option<Tensor<B>>,
}

impl<B: Backend> ConvState<B> {
    fn new(
        name: &str,
        weight: Tensor<B>,
        bias: Option<Tensor<B>>,
        window: Window2d,
    ) -> Result<Self> {
        let c_out = weight.dims()[0];
        if let Some(b) = &bias {
            if b.dims() != [c_out] {
                return Err(Error::ShapeMismatch {
                    op: "conv",
                    lhs: b.shape().clone(),
                    rhs: Shape::from(c_out),
                });
            }
        }
        Ok(ConvState {
            weight,
            bias,
            window,
            buffers: LayerBuffers::new(name),
            ids: None,
            input: None,
        })
    }

    fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    fn in_channels(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Allocate every buffer for a resolved 2-D geometry.
    fn alloc(&mut self, input_shape: &Shape, output_shape: &Shape, geom: &Geometry2d) -> Result<()> {
        let (dtype, device) = (self.weight.dtype(), self.weight.device().clone());
        let (columns, rows) = ConvWorkspace::<B>::shapes(geom, self.out_channels());
        let kernel_shape = self.weight.shape().clone();
        let bias_len = self.bias.as_ref().map(|b| b.elem_count());
        self.ids = None;
        self.input = None;

        let arena = self.buffers.reopen();
        let ids = ConvBuffers {
            output: arena.alloc(BufferRole::Output, output_shape, dtype, &device)?,
            input_grad: arena.alloc(BufferRole::InputGrad, input_shape, dtype, &device)?,
            kernel_grad: arena.alloc(BufferRole::KernelGrad, kernel_shape, dtype, &device)?,
            bias_grad: match bias_len {
                Some(n) => Some(arena.alloc(BufferRole::BiasGrad, n, dtype, &device)?),
                None => None,
            },
            columns: arena.alloc(BufferRole::Scratch("columns"), columns, dtype, &device)?,
            rows: arena.alloc(BufferRole::Scratch("rows"), rows, dtype, &device)?,
        };
        self.buffers.seal(input_shape, output_shape);
        self.ids = Some(ids);
        Ok(())
    }

    fn workspace(&self, ids: &ConvBuffers) -> Result<(Tensor<B>, Tensor<B>)> {
        Ok((self.buffers.get(ids.columns)?, self.buffers.get(ids.rows)?))
    }

    fn cached_input(&self, op: &'static str) -> Result<&Tensor<B>> {
        self.input
            .as_ref()
            .ok_or_else(|| Error::missing_state(op, "no cached input"))
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        let mut params = vec![self.weight.clone()];
        if let Some(b) = &self.bias {
            params.push(b.clone());
        }
        params
    }

    fn gradients(&self) -> Vec<Tensor<B>> {
        let Some(ids) = self.ids else {
            return Vec::new();
        };
        std::iter::once(ids.kernel_grad)
            .chain(ids.bias_grad)
            .filter_map(|id| self.buffers.get(id).ok())
            .collect()
    }

    fn check_channels(&self, op: &'static str, input_shape: &Shape) -> Result<()> {
        if input_shape.dims()[1] != self.in_channels() {
            return Err(Error::ShapeMismatch {
                op,
                lhs: input_shape.clone(),
                rhs: self.weight.shape().clone(),
            });
        }
        Ok(())
    }
}

/// 2-D convolution over `[N, C_in, H, W]` inputs.
///
/// # Example
/// ```ignore
/// let mut conv = Conv2d::<CpuBackend>::new(1, 16, [3, 3], [1, 1], [1, 1], true, DType::F32, &dev)?;
/// conv.init(&Shape::from((4, 1, 28, 28)))?;
/// let y = conv.forward(&x)?; // [4, 16, 28, 28]
/// ```
pub struct Conv2d<B: Backend> {
    state: ConvState<B>,
}

impl<B: Backend> Conv2d<B> {
    /// A Conv2d with Kaiming-uniform filters. The window is validated before
    /// any parameter is allocated.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let window = Window2d::new(kernel_size, stride, padding)?;
        let shape = Shape::from((out_channels, in_channels, kernel_size[0], kernel_size[1]));
        let bias = if use_bias {
            Some(init::default_bias::<B>(&shape, out_channels, dtype, device)?)
        } else {
            None
        };
        let weight = init::default_weight::<B>(shape, dtype, device)?;
        Ok(Conv2d {
            state: ConvState::new("conv2d", weight, bias, window)?,
        })
    }

    /// A Conv2d around existing filters; the kernel size is read from
    /// `weight`.
    pub fn from_tensors(
        weight: Tensor<B>,
        bias: Option<Tensor<B>>,
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        expect_rank("conv2d", weight.shape(), 4)?;
        let kd = weight.dims();
        let window = Window2d::new([kd[2], kd[3]], stride, padding)?;
        Ok(Conv2d {
            state: ConvState::new("conv2d", weight, bias, window)?,
        })
    }

    pub fn weight(&self) -> &Tensor<B> {
        &self.state.weight
    }

    pub fn bias(&self) -> Option<&Tensor<B>> {
        self.state.bias.as_ref()
    }

    pub fn window(&self) -> &Window2d {
        &self.state.window
    }

    fn geometry(&self, op: &'static str, input_shape: &Shape) -> Result<Geometry2d> {
        expect_rank(op, input_shape, 4)?;
        self.state.check_channels(op, input_shape)?;
        Geometry2d::resolve(input_shape, self.state.window)
    }
}

impl<B: Backend> Layer<B> for Conv2d<B> {
    fn name(&self) -> &str {
        "conv2d"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        let geom = self.geometry("conv2d", input_shape)?;
        Ok(geom.output_shape(self.state.out_channels()))
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let geom = self.geometry("conv2d.init", input_shape)?;
        let output_shape = geom.output_shape(self.state.out_channels());
        self.state.alloc(input_shape, &output_shape, &geom)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let op = "conv2d.forward";
        let s = &mut self.state;
        s.buffers.check_input(op, x)?;
        let ids = initialised(&s.ids, op)?;
        let out = s.buffers.get(ids.output)?;
        let (columns, rows) = s.workspace(&ids)?;
        let ws = ConvWorkspace::new(&columns, &rows);
        ops::conv2d_to(&out, x, &s.weight, s.bias.as_ref(), &s.window, &ws)?;
        s.input = Some(x.clone());
        s.buffers.mark_forward();
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let op = "conv2d.backward";
        let s = &self.state;
        s.buffers.check_backward(op, grad_out)?;
        let ids = initialised(&s.ids, op)?;
        let x = s.cached_input(op)?;
        let dx = s.buffers.get(ids.input_grad)?;
        let dk = s.buffers.get(ids.kernel_grad)?;
        let db = ids.bias_grad.map(|id| s.buffers.get(id)).transpose()?;
        let (columns, rows) = s.workspace(&ids)?;
        let grads = ConvGrads {
            input: Some(&dx),
            kernel: &dk,
            bias: db.as_ref(),
        };
        ops::conv2d_backward_to(
            grads,
            grad_out,
            x,
            &s.weight,
            &s.window,
            &ConvWorkspace::new(&columns, &rows),
        )?;
        Ok(dx)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.state.parameters()
    }

    fn gradients(&self) -> Vec<Tensor<B>> {
        self.state.gradients()
    }
}

/// 1-D convolution over `[N, C_in, L]` inputs.
pub struct Conv1d<B: Backend> {
    state: ConvState<B>,
}

impl<B: Backend> Conv1d<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let window = Window2d::for_1d(kernel_size, stride, padding)?;
        let shape = Shape::from((out_channels, in_channels, kernel_size));
        let bias = if use_bias {
            Some(init::default_bias::<B>(&shape, out_channels, dtype, device)?)
        } else {
            None
        };
        let weight = init::default_weight::<B>(shape, dtype, device)?;
        Ok(Conv1d {
            state: ConvState::new("conv1d", weight, bias, window)?,
        })
    }

    pub fn from_tensors(
        weight: Tensor<B>,
        bias: Option<Tensor<B>>,
        stride: usize,
        padding: usize,
    ) -> Result<Self> {
        expect_rank("conv1d", weight.shape(), 3)?;
        let window = Window2d::for_1d(weight.dims()[2], stride, padding)?;
        Ok(Conv1d {
            state: ConvState::new("conv1d", weight, bias, window)?,
        })
    }

    pub fn weight(&self) -> &Tensor<B> {
        &self.state.weight
    }

    pub fn bias(&self) -> Option<&Tensor<B>> {
        self.state.bias.as_ref()
    }

    /// Geometry of the `[N, C, L, 1]` view the engine works on.
    fn geometry(&self, op: &'static str, input_shape: &Shape) -> Result<Geometry2d> {
        expect_rank(op, input_shape, 3)?;
        self.state.check_channels(op, input_shape)?;
        let d = input_shape.dims();
        Geometry2d::resolve(&Shape::from((d[0], d[1], d[2], 1)), self.state.window)
    }
}

impl<B: Backend> Layer<B> for Conv1d<B> {
    fn name(&self) -> &str {
        "conv1d"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        let geom = self.geometry("conv1d", input_shape)?;
        Ok(Shape::from((geom.batch, self.state.out_channels(), geom.out_hw[0])))
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let geom = self.geometry("conv1d.init", input_shape)?;
        let output_shape = Shape::from((geom.batch, self.state.out_channels(), geom.out_hw[0]));
        self.state.alloc(input_shape, &output_shape, &geom)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let op = "conv1d.forward";
        let s = &mut self.state;
        s.buffers.check_input(op, x)?;
        let ids = initialised(&s.ids, op)?;
        let out = s.buffers.get(ids.output)?;
        let (columns, rows) = s.workspace(&ids)?;
        let ws = ConvWorkspace::new(&columns, &rows);
        ops::conv1d_to(&out, x, &s.weight, s.bias.as_ref(), &s.window, &ws)?;
        s.input = Some(x.clone());
        s.buffers.mark_forward();
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let op = "conv1d.backward";
        let s = &self.state;
        s.buffers.check_backward(op, grad_out)?;
        let ids = initialised(&s.ids, op)?;
        let x = s.cached_input(op)?;
        let (columns, rows) = s.workspace(&ids)?;
        let ws = ConvWorkspace::new(&columns, &rows);

        ops::conv1d_kernel_grad_to(&s.buffers.get(ids.kernel_grad)?, grad_out, x, &s.window, &ws)?;
        if let Some(db) = ids.bias_grad {
            ops::conv1d_bias_grad_to(&s.buffers.get(db)?, grad_out)?;
        }
        let dx = s.buffers.get(ids.input_grad)?;
        ops::conv1d_input_grad_to(&dx, grad_out, &s.weight, &s.window, &ws)?;
        Ok(dx)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.state.parameters()
    }

    fn gradients(&self) -> Vec<Tensor<B>> {
        self.state.gradients()
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
    fn conv2d_box_filter() {
        let w = t(&[1.0; 4], (1, 1, 2, 2));
        let b = t(&[0.5], 1);
        let mut conv = Conv2d::from_tensors(w, Some(b), [1, 1], [0, 0]).unwrap();
        conv.init(&Shape::from((1, 1, 3, 3))).unwrap();
        let x = t(&[1., 2., 3., 4., 5., 6., 7., 8., 9.], (1, 1, 3, 3));
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), vec![12.5, 16.5, 24.5, 28.5]);

        let g = t(&[1.0; 4], (1, 1, 2, 2));
        let dx = conv.backward(&g).unwrap();
        assert_eq!(
            dx.to_f64_vec().unwrap(),
            vec![1., 2., 1., 2., 4., 2., 1., 2., 1.]
        );
        let grads = conv.gradients();
        assert_eq!(grads[0].to_f64_vec().unwrap(), vec![12., 16., 24., 28.]);
        assert_eq!(grads[1].to_f64_vec().unwrap(), vec![4.]);
    }

    #[test]
    fn conv1d_shapes_and_bias_grad() {
        let mut conv =
            Conv1d::<CpuBackend>::new(2, 3, 3, 2, 1, true, DType::F64, &CpuDevice).unwrap();
        let input = Shape::from((2, 2, 7));
        assert_eq!(conv.output_shape(&input).unwrap(), Shape::from((2, 3, 4)));
        conv.init(&input).unwrap();
        let x = CpuTensor::randn(input.clone(), DType::F64, &CpuDevice).unwrap();
        conv.forward(&x).unwrap();
        let g = CpuTensor::ones((2, 3, 4), DType::F64, &CpuDevice).unwrap();
        let dx = conv.backward(&g).unwrap();
        assert_eq!(dx.shape(), &input);
        assert_eq!(conv.gradients()[1].to_f64_vec().unwrap(), vec![8.0; 3]);
    }

    #[test]
    fn invalid_window_is_rejected_up_front() {
        let err = Conv2d::<CpuBackend>::new(1, 1, [3, 3], [0, 1], [0, 0], false, DType::F32, &CpuDevice)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::UnsupportedConfiguration);
    }

    #[test]
    fn channel_mismatch_on_init() {
        let mut conv =
            Conv2d::<CpuBackend>::new(3, 4, [3, 3], [1, 1], [1, 1], true, DType::F32, &CpuDevice)
                .unwrap();
        let err = conv.init(&Shape::from((1, 2, 8, 8))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    }
}
