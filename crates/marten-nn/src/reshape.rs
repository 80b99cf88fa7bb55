// Shape layers — Reshape, Squeeze, Unsqueeze, Transpose
//
// None of these touch values. Forward copies the input into the layer's
// output buffer under a different shape (or dimension order); backward
// copies the gradient back the other way:
//
//   Reshape([2, 6])     [2, 3, 2]    -> [2, 6]
//   Squeeze(None)       [4, 1, 3, 1] -> [4, 3]
//   Squeeze([1])        [4, 1, 3, 1] -> [4, 3, 1]
//   Unsqueeze(1)        [4, 3]       -> [4, 1, 3]
//   Transpose([1, 0])   [4, 3]       -> [3, 4]
//
// The copy is made through a view of the destination with the source's
// shape, so strided inputs and gradients are read in logical order and the
// buffers handed out stay dense.

use marten_core::backend::Backend;
use marten_core::dtype::DType;
use marten_core::error::{Error, Result};
use marten_core::ops;
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;
use marten_core::{BufferId, BufferRole};

use crate::layer::{expect_rank, initialised, LayerBuffers};

#[derive(Clone, Copy)]
struct RelayoutBuffers {
    output: BufferId,
    input_grad: BufferId,
}

/// Output and input-gradient buffers of a layer that only moves values.
pub(crate) struct Relayout<B: Backend> {
    dtype: DType,
    device: B::Device,
    buffers: LayerBuffers<B>,
    ids: Option<RelayoutBuffers>,
}

impl<B: Backend> Relayout<B> {
    pub(crate) fn new(owner: &str, dtype: DType, device: &B::Device) -> Self {
        Relayout {
            dtype,
            device: device.clone(),
            buffers: LayerBuffers::new(owner),
            ids: None,
        }
    }

    pub(crate) fn init(&mut self, input_shape: &Shape, output_shape: &Shape) -> Result<()> {
        self.ids = None;
        let (dtype, device) = (self.dtype, self.device.clone());
        let arena = self.buffers.reopen();
        let ids = RelayoutBuffers {
            output: arena.alloc(BufferRole::Output, output_shape, dtype, &device)?,
            input_grad: arena.alloc(BufferRole::InputGrad, input_shape, dtype, &device)?,
        };
        self.buffers.seal(input_shape, output_shape);
        self.ids = Some(ids);
        Ok(())
    }

    /// Copy `x` into the output buffer, seen through `as_input`: a view of
    /// the output with the input's shape.
    pub(crate) fn forward(
        &mut self,
        op: &'static str,
        x: &Tensor<B>,
        as_input: impl FnOnce(&Tensor<B>) -> Result<Tensor<B>>,
    ) -> Result<Tensor<B>> {
        self.forward_with(op, x, |out, x| {
            ops::copy_to(&as_input(out)?, x)?;
            Ok(())
        })
    }

    /// Copy `grad_out` into the input-gradient buffer, seen through
    /// `as_output`: a view of that buffer with the output's shape.
    pub(crate) fn backward(
        &mut self,
        op: &'static str,
        grad_out: &Tensor<B>,
        as_output: impl FnOnce(&Tensor<B>) -> Result<Tensor<B>>,
    ) -> Result<Tensor<B>> {
        self.backward_with(op, grad_out, |dx, grad_out| {
            ops::copy_to(&as_output(dx)?, grad_out)?;
            Ok(())
        })
    }

    /// Checked forward step: `write(out, x)` fills the output buffer.
    pub(crate) fn forward_with(
        &mut self,
        op: &'static str,
        x: &Tensor<B>,
        write: impl FnOnce(&Tensor<B>, &Tensor<B>) -> Result<()>,
    ) -> Result<Tensor<B>> {
        self.buffers.check_input(op, x)?;
        let out = self.buffers.get(initialised(&self.ids, op)?.output)?;
        write(&out, x)?;
        self.buffers.mark_forward();
        Ok(out)
    }

    /// Checked backward step: `write(dx, grad_out)` fills the input gradient.
    pub(crate) fn backward_with(
        &mut self,
        op: &'static str,
        grad_out: &Tensor<B>,
        write: impl FnOnce(&Tensor<B>, &Tensor<B>) -> Result<()>,
    ) -> Result<Tensor<B>> {
        self.buffers.check_backward(op, grad_out)?;
        let dx = self.buffers.get(initialised(&self.ids, op)?.input_grad)?;
        write(&dx, grad_out)?;
        Ok(dx)
    }
}

// Reshape

/// Reinterprets the input with a fixed target shape, batch dimension
/// included.
pub struct Reshape<B: Backend> {
    target: Shape,
    inner: Relayout<B>,
}

impl<B: Backend> Reshape<B> {
    pub fn new(target: impl Into<Shape>, dtype: DType, device: &B::Device) -> Self {
        Reshape {
            target: target.into(),
            inner: Relayout::new("reshape", dtype, device),
        }
    }
}

impl<B: Backend> crate::Layer<B> for Reshape<B> {
    fn name(&self) -> &str {
        "reshape"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        if input_shape.elem_count() != self.target.elem_count() {
            return Err(Error::ShapeMismatch {
                op: "reshape",
                lhs: input_shape.clone(),
                rhs: self.target.clone(),
            });
        }
        Ok(self.target.clone())
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let output_shape = self.output_shape(input_shape)?;
        self.inner.init(input_shape, &output_shape)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        self.inner
            .forward("reshape.forward", x, |out| out.reshape(x.shape()))
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        self.inner
            .backward("reshape.backward", grad_out, |dx| dx.reshape(grad_out.shape()))
    }
}

// Squeeze

/// Removes size-1 dimensions: all of them, or only the listed ones.
pub struct Squeeze<B: Backend> {
    dims: Option<Vec<usize>>,
    inner: Relayout<B>,
}

impl<B: Backend> Squeeze<B> {
    /// Squeeze every size-1 dimension.
    pub fn new(dtype: DType, device: &B::Device) -> Self {
        Squeeze {
            dims: None,
            inner: Relayout::new("squeeze", dtype, device),
        }
    }

    /// Squeeze exactly `dims`, each of which must have size 1.
    pub fn dims(dims: &[usize], dtype: DType, device: &B::Device) -> Self {
        Squeeze {
            dims: Some(dims.to_vec()),
            inner: Relayout::new("squeeze", dtype, device),
        }
    }
}

impl<B: Backend> crate::Layer<B> for Squeeze<B> {
    fn name(&self) -> &str {
        "squeeze"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        let dims = input_shape.dims();
        let Some(selected) = &self.dims else {
            return Ok(Shape::new(dims.iter().copied().filter(|&d| d != 1).collect()));
        };
        for &d in selected {
            let size = input_shape.dim(d)?;
            if size != 1 {
                return Err(Error::unsupported(
                    "squeeze",
                    format!("dim {d} of {input_shape} has size {size}"),
                ));
            }
        }
        Ok(Shape::new(
            dims.iter()
                .enumerate()
                .filter(|(i, _)| !selected.contains(i))
                .map(|(_, &d)| d)
                .collect(),
        ))
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let output_shape = self.output_shape(input_shape)?;
        self.inner.init(input_shape, &output_shape)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        self.inner
            .forward("squeeze.forward", x, |out| out.reshape(x.shape()))
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        self.inner
            .backward("squeeze.backward", grad_out, |dx| dx.reshape(grad_out.shape()))
    }
}

// Unsqueeze

/// Inserts a size-1 dimension at `dim`.
pub struct Unsqueeze<B: Backend> {
    dim: usize,
    inner: Relayout<B>,
}

impl<B: Backend> Unsqueeze<B> {
    pub fn new(dim: usize, dtype: DType, device: &B::Device) -> Self {
        Unsqueeze {
            dim,
            inner: Relayout::new("unsqueeze", dtype, device),
        }
    }
}

impl<B: Backend> crate::Layer<B> for Unsqueeze<B> {
    fn name(&self) -> &str {
        "unsqueeze"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        let rank = input_shape.rank();
        if self.dim > rank {
            return Err(Error::DimOutOfRange {
                dim: self.dim,
                rank,
            });
        }
        let mut dims = input_shape.dims().to_vec();
        dims.insert(self.dim, 1);
        Ok(Shape::new(dims))
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let output_shape = self.output_shape(input_shape)?;
        self.inner.init(input_shape, &output_shape)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        self.inner
            .forward("unsqueeze.forward", x, |out| out.reshape(x.shape()))
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        self.inner
            .backward("unsqueeze.backward", grad_out, |dx| dx.reshape(grad_out.shape()))
    }
}

// Transpose

/// Reorders dimensions: output dim `i` is input dim `order[i]`.
pub struct Transpose<B: Backend> {
    order: Vec<usize>,
    inverse: Vec<usize>,
    inner: Relayout<B>,
}

impl<B: Backend> Transpose<B> {
    /// Swap the two dimensions of a rank-2 input.
    pub fn new(dtype: DType, device: &B::Device) -> Self {
        Transpose {
            order: vec![1, 0],
            inverse: vec![1, 0],
            inner: Relayout::new("transpose", dtype, device),
        }
    }

    /// An arbitrary permutation of the input dimensions.
    pub fn with_order(order: &[usize], dtype: DType, device: &B::Device) -> Result<Self> {
        let mut inverse = vec![usize::MAX; order.len()];
        for (i, &d) in order.iter().enumerate() {
            match inverse.get_mut(d) {
                Some(slot) if *slot == usize::MAX => *slot = i,
                _ => {
                    return Err(Error::unsupported(
                        "transpose",
                        format!("{order:?} is not a permutation"),
                    ))
                }
            }
        }
        Ok(Transpose {
            order: order.to_vec(),
            inverse,
            inner: Relayout::new("transpose", dtype, device),
        })
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

impl<B: Backend> crate::Layer<B> for Transpose<B> {
    fn name(&self) -> &str {
        "transpose"
    }

    fn output_shape(&self, input_shape: &Shape) -> Result<Shape> {
        expect_rank("transpose", input_shape, self.order.len())?;
        let dims = input_shape.dims();
        Ok(Shape::new(self.order.iter().map(|&d| dims[d]).collect()))
    }

    fn init(&mut self, input_shape: &Shape) -> Result<()> {
        let output_shape = self.output_shape(input_shape)?;
        self.inner.init(input_shape, &output_shape)
    }

    fn forward(&mut self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let inverse = &self.inverse;
        self.inner
            .forward("transpose.forward", x, |out| out.permute(inverse))
    }

    fn backward(&mut self, grad_out: &Tensor<B>) -> Result<Tensor<B>> {
        let order = &self.order;
        self.inner
            .backward("transpose.backward", grad_out, |dx| dx.permute(order))
    }
}
