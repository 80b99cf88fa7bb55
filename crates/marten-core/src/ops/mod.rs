// Destination-passing operation families
//
// Every function here has the shape
//
//   op_to(dst, inputs.., params..) -> Result<&dst>
//
// and follows the same sequence:
//
//   1. resolve the output shape from the inputs (broadcast, geometry, ...)
//   2. validate `dst` against it: dtype, exact shape, no zero strides, dense
//      where the kernel requires it
//   3. resolve aliasing between `dst` and each source
//   4. take read locks on the sources, then the write lock on `dst`
//   5. run one backend kernel
//
// Steps 1-3 never touch memory, so a failing call leaves `dst` exactly as
// it was. Composite ops (convolution) run all of their checks up front
// before the first sub-op writes anything.
//
// ALIASING:
//
// Each tensor holds its storage behind `Arc<RwLock<..>>`. A source that
// shares storage with `dst` cannot be read-locked while `dst` is
// write-locked, so it is either rejected (InvalidDestination) or, for
// kernels where output i depends only on input i, passed to the backend as
// `Operand::Destination` and read through the destination buffer itself.
// The latter is only sound when the two layouts are identical.

pub mod activation;
pub mod conv;
pub mod elementwise;
pub mod linalg;
pub mod pool;
pub mod reduce;

use std::sync::RwLockReadGuard;

use crate::backend::{Backend, Operand};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;
use crate::tensor::Tensor;

pub use activation::{
    relu_grad_masked_to, relu_grad_to, sigmoid_grad_to, softmax_grad_to, tanh_grad_to,
};
pub use conv::{
    col2im_to, conv1d_bias_grad_to, conv1d_input_grad_to, conv1d_kernel_grad_to, conv1d_to,
    conv2d_backward_to, conv2d_bias_grad_to, conv2d_input_grad_to, conv2d_kernel_grad_to,
    conv2d_to, conv_transpose2d_to, im2col_to, ConvGrads, ConvWorkspace,
};
pub use elementwise::{
    add_to, affine_to, binary_assign, binary_to, cmp_scalar_to, copy_to, div_to, expand_to, fill,
    fill_uniform, mul_to, relu_mask_to, sub_to, unary_to,
};
pub use linalg::{matmul_acc_to, matmul_to};
pub use pool::{
    adaptive_avg_pool2d_backward_to, adaptive_avg_pool2d_to, avg_pool2d_backward_to,
    avg_pool2d_to, global_avg_pool2d_backward_to, global_avg_pool2d_to, max_pool2d_backward_to,
    max_pool2d_to, PoolIndices,
};
pub use reduce::{max_to, mean_to, min_to, reduce_to, softmax_to, sum_to};

/// Check `dst` can receive a result of `shape` and `dtype`.
pub(crate) fn check_dst<B: Backend>(
    op: &'static str,
    dst: &Tensor<B>,
    shape: &Shape,
    dtype: DType,
) -> Result<()> {
    if dst.dtype() != dtype {
        return Err(Error::invalid_destination(
            op,
            format!("dtype {} but the result is {}", dst.dtype(), dtype),
        ));
    }
    if dst.shape() != shape {
        return Err(Error::invalid_destination(
            op,
            format!("shape {} but the result is {}", dst.shape(), shape),
        ));
    }
    check_writable(op, dst)
}

/// A destination may not repeat a storage slot across logical positions.
pub(crate) fn check_writable<B: Backend>(op: &'static str, dst: &Tensor<B>) -> Result<()> {
    if dst.layout().has_broadcast_dims() {
        return Err(Error::invalid_destination(
            op,
            format!("broadcast view {} cannot be written", dst.shape()),
        ));
    }
    Ok(())
}

/// Matmul, reduction and spatial kernels write row-major runs.
pub(crate) fn check_dense<B: Backend>(op: &'static str, dst: &Tensor<B>) -> Result<()> {
    if !dst.layout().is_dense() {
        return Err(Error::invalid_destination(
            op,
            format!("strided view {} must be dense", dst.shape()),
        ));
    }
    Ok(())
}

/// Sources of one op must agree on dtype.
pub(crate) fn check_same_dtype(op: &'static str, expected: DType, got: DType) -> Result<()> {
    if expected != got {
        return Err(Error::DTypeMismatch { op, expected, got });
    }
    Ok(())
}

/// Operands of a fused kernel must have identical shapes.
pub(crate) fn check_same_shape(op: &'static str, lhs: &Shape, rhs: &Shape) -> Result<()> {
    if lhs != rhs {
        return Err(Error::ShapeMismatch {
            op,
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        });
    }
    Ok(())
}

/// Outputs of a composite op must not share storage with each other or
/// with any of its sources.
pub(crate) fn check_disjoint<B: Backend>(
    op: &'static str,
    outputs: &[&Tensor<B>],
    sources: &[&Tensor<B>],
) -> Result<()> {
    for (i, a) in outputs.iter().enumerate() {
        let clash = outputs[i + 1..]
            .iter()
            .chain(sources.iter())
            .any(|b| a.shares_storage(b));
        if clash {
            return Err(Error::invalid_destination(
                op,
                format!("output {} aliases another operand", a.shape()),
            ));
        }
    }
    Ok(())
}

/// Output shape of reducing `shape` over `dims`.
pub fn reduced_shape(shape: &Shape, dims: &[usize], keep_dim: bool) -> Result<Shape> {
    let rank = shape.rank();
    let mut seen = vec![false; rank];
    for &d in dims {
        if d >= rank {
            return Err(Error::DimOutOfRange { dim: d, rank });
        }
        if seen[d] {
            return Err(Error::unsupported(
                "reduce",
                format!("dimension {d} listed twice"),
            ));
        }
        seen[d] = true;
    }
    if keep_dim {
        return shape.reduced(dims);
    }
    let dims = shape
        .dims()
        .iter()
        .zip(seen.iter())
        .filter(|&(_, &r)| !r)
        .map(|(&d, _)| d)
        .collect::<Vec<_>>();
    Ok(Shape::new(dims))
}

/// One read operand of a kernel, with aliasing already resolved.
pub(crate) struct Source<'t, B: Backend> {
    tensor: &'t Tensor<B>,
    layout: Layout,
    in_place: bool,
}

impl<'t, B: Backend> Source<'t, B> {
    /// A source for an in-place-safe kernel: aliasing `dst` is allowed when
    /// `layout` addresses exactly the destination's elements.
    pub(crate) fn new(
        op: &'static str,
        dst: &Tensor<B>,
        tensor: &'t Tensor<B>,
        layout: Layout,
    ) -> Result<Self> {
        let in_place = tensor.shares_storage(dst);
        if in_place && &layout != dst.layout() {
            return Err(Error::invalid_destination(
                op,
                "destination overlaps a source with a different layout",
            ));
        }
        Ok(Source {
            tensor,
            layout,
            in_place,
        })
    }

    /// A source for a kernel that must not run in place.
    pub(crate) fn exclusive(
        op: &'static str,
        dst: &Tensor<B>,
        tensor: &'t Tensor<B>,
        layout: Layout,
    ) -> Result<Self> {
        if tensor.shares_storage(dst) {
            return Err(Error::invalid_destination(
                op,
                "destination aliases a source of a kernel that cannot run in place",
            ));
        }
        Ok(Source {
            tensor,
            layout,
            in_place: false,
        })
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Read guard on the source storage, or `None` when reading in place.
    pub(crate) fn lock(&self) -> Result<Option<RwLockReadGuard<'t, B::Storage>>> {
        if self.in_place {
            Ok(None)
        } else {
            self.tensor.read_storage().map(Some)
        }
    }

    pub(crate) fn operand<'a>(
        &'a self,
        guard: &'a Option<RwLockReadGuard<'t, B::Storage>>,
    ) -> Operand<'a, B::Storage> {
        match guard {
            Some(g) => Operand::Buffer(&**g, &self.layout),
            None => Operand::Destination,
        }
    }
}
