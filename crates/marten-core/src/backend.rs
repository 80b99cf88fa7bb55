use std::fmt;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;
use crate::window::Geometry2d;

// Backend — the capability set a tensor runtime provides
//
// The gradient engine in `ops` never touches memory itself. It validates
// shapes, resolves broadcasting and aliasing, then calls into a backend
// through four capability traits:
//
//   ElementwiseOps — fill, copy, unary/binary/affine maps, masks, fused
//                    activation gradients
//   ReduceOps      — sums/means/extrema over a set of dims, softmax and its
//                    gradient along one dim
//   LinalgOps      — 2-D matrix multiply; transposed operands arrive as
//                    transposed (strided) layouts
//   SpatialOps     — im2col/col2im and the pooling kernels
//
// `Backend` is implemented automatically for any type providing all of them.
//
// DESTINATION-PASSING:
//
// Every kernel writes into a `&mut Self::Storage` described by a layout the
// engine has already validated (shape, dtype, no zero strides, dense where
// required). Kernels never resize a destination.
//
// IN-PLACE SOURCES:
//
// Elementwise kernels take their inputs as `Operand`s. `Operand::Destination`
// means "read the destination's current value at the same position", which
// is how `x = f(x)` runs without a second borrow of the same buffer. The
// engine only passes it when the source layout equals the destination
// layout.

/// Identifies a compute device.
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device (e.g. "cpu").
    fn name(&self) -> String;
}

/// A storage buffer that holds tensor data on a specific device.
pub trait BackendStorage: Send + Sync + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// Total number of elements that fit in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

impl BinaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Minimum => "minimum",
        }
    }
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Square,
    Relu,
    Sigmoid,
    Tanh,
}

impl UnaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Square => "square",
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Tanh => "tanh",
        }
    }
}

/// Reductions over a set of dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

impl ReduceOp {
    pub fn name(&self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Mean => "mean",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
        }
    }
}

/// Comparisons producing U8 masks (0 or 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Fused activation-gradient kernels.
///
/// | op         | aux operand | formula                    |
/// |------------|-------------|----------------------------|
/// | `Sigmoid`  | output `y`  | `g * y * (1 - y)`          |
/// | `Tanh`     | output `y`  | `g * (1 - y²)`             |
/// | `Relu`     | input `x`   | `g * (x > 0 ? 1 : 0)`      |
/// | `ReluMask` | U8 mask `m` | `g * (m != 0 ? 1 : 0)`     |
///
/// Each output element depends only on the same position of its operands,
/// so all four may run with the destination standing in for either operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradOp {
    Sigmoid,
    Tanh,
    Relu,
    ReluMask,
}

impl GradOp {
    pub fn name(&self) -> &'static str {
        match self {
            GradOp::Sigmoid => "sigmoid_grad",
            GradOp::Tanh => "tanh_grad",
            GradOp::Relu => "relu_grad",
            GradOp::ReluMask => "relu_grad_masked",
        }
    }
}

/// A kernel input: either a separate buffer or the destination itself.
pub enum Operand<'a, S> {
    Buffer(&'a S, &'a Layout),
    Destination,
}

impl<S> Clone for Operand<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Operand<'_, S> {}

impl<S: BackendStorage> Operand<'_, S> {
    /// The operand dtype, using `dst` when it reads the destination.
    pub fn dtype(&self, dst: DType) -> DType {
        match self {
            Operand::Buffer(s, _) => s.dtype(),
            Operand::Destination => dst,
        }
    }
}

/// Device and storage types shared by every capability trait.
pub trait BackendBase: Clone + Send + Sync + fmt::Debug + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    /// Short backend name used in error messages.
    fn backend_name() -> &'static str;
}

/// Allocation and host transfer.
pub trait StorageOps: BackendBase {
    /// Allocate storage filled with zeros.
    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate storage filled with a constant value.
    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage from a flat f64 slice, converting to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Storage with values drawn uniformly from [0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Storage with values drawn from N(0, 1).
    fn rand_normal(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Read the elements described by `layout` into host memory, in logical order.
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;
}

/// Element-wise kernels. Operand layouts already match the destination shape.
pub trait ElementwiseOps: BackendBase {
    /// Set every element of `dst` to `value`.
    fn fill(dst: &mut Self::Storage, dst_layout: &Layout, value: f64) -> Result<()>;

    /// Overwrite `dst` with values drawn uniformly from [0, 1).
    fn fill_uniform(dst: &mut Self::Storage, dst_layout: &Layout) -> Result<()>;

    /// `dst[i] = src[i]`, `src` may be strided or broadcast.
    fn copy_to(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        src: &Self::Storage,
        src_layout: &Layout,
    ) -> Result<()>;

    /// `dst[i] = op(src[i])`.
    fn unary_to(
        op: UnaryOp,
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        src: Operand<'_, Self::Storage>,
    ) -> Result<()>;

    /// `dst[i] = src[i] * mul + add`.
    fn affine_to(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        src: Operand<'_, Self::Storage>,
        mul: f64,
        add: f64,
    ) -> Result<()>;

    /// `dst[i] = op(lhs[i], rhs[i])`.
    fn binary_to(
        op: BinaryOp,
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        lhs: Operand<'_, Self::Storage>,
        rhs: Operand<'_, Self::Storage>,
    ) -> Result<()>;

    /// `dst[i] = (src[i] op rhs) as u8`; `dst` is U8.
    fn cmp_scalar_to(
        op: CmpOp,
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        src: &Self::Storage,
        src_layout: &Layout,
        rhs: f64,
    ) -> Result<()>;

    /// Fused activation gradient, see [`GradOp`].
    fn fused_grad_to(
        op: GradOp,
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        grad: Operand<'_, Self::Storage>,
        aux: Operand<'_, Self::Storage>,
    ) -> Result<()>;
}

/// Reductions. Destinations are dense and hold the keep-dim result in
/// row-major order (whether or not the caller's shape keeps the dims).
pub trait ReduceOps: BackendBase {
    fn reduce_to(
        op: ReduceOp,
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        src: &Self::Storage,
        src_layout: &Layout,
        dims: &[usize],
    ) -> Result<()>;

    /// Numerically stable softmax along `dim`.
    fn softmax_to(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        src: &Self::Storage,
        src_layout: &Layout,
        dim: usize,
    ) -> Result<()>;

    /// `dst = y * (g - Σ_dim(g * y))` with `y` the softmax output.
    #[allow(clippy::too_many_arguments)]
    fn softmax_grad_to(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        grad: &Self::Storage,
        grad_layout: &Layout,
        output: &Self::Storage,
        output_layout: &Layout,
        dim: usize,
    ) -> Result<()>;
}

/// Matrix multiplication.
pub trait LinalgOps: BackendBase {
    /// `dst = lhs @ rhs` (or `dst += lhs @ rhs` when `accumulate`).
    ///
    /// All three are rank 2. `lhs`/`rhs` may be strided, which is how the
    /// transposed-operand variants are expressed. `dst` is dense.
    #[allow(clippy::too_many_arguments)]
    fn matmul_to(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
        accumulate: bool,
    ) -> Result<()>;
}

/// Spatial kernels over `[N, C, H, W]` tensors.
///
/// Every method has a default that reports [`Error::Unimplemented`], so a
/// backend without spatial support still satisfies [`Backend`] and callers
/// get a catchable error instead of a silent no-op.
pub trait SpatialOps: BackendBase {
    /// Patch extraction: `dst` is `[N*H_out*W_out, C*kH*kW]`. Positions that
    /// fall in the padding read as zero.
    fn im2col_to(
        _dst: &mut Self::Storage,
        _dst_layout: &Layout,
        _src: &Self::Storage,
        _src_layout: &Layout,
        _geom: &Geometry2d,
    ) -> Result<()> {
        Err(Error::unimplemented("im2col", Self::backend_name()))
    }

    /// Inverse of [`SpatialOps::im2col_to`]: clears `dst` and sums every
    /// column entry back onto its input position. Padding entries are dropped.
    fn col2im_to(
        _dst: &mut Self::Storage,
        _dst_layout: &Layout,
        _cols: &Self::Storage,
        _cols_layout: &Layout,
        _geom: &Geometry2d,
    ) -> Result<()> {
        Err(Error::unimplemented("col2im", Self::backend_name()))
    }

    /// Max pooling; writes the flat input offset of each selected element
    /// into the I64 `indices`.
    #[allow(clippy::too_many_arguments)]
    fn max_pool2d_to(
        _dst: &mut Self::Storage,
        _dst_layout: &Layout,
        _indices: &mut Self::Storage,
        _indices_layout: &Layout,
        _src: &Self::Storage,
        _src_layout: &Layout,
        _geom: &Geometry2d,
    ) -> Result<()> {
        Err(Error::unimplemented("max_pool2d", Self::backend_name()))
    }

    /// Clears `dst` then adds each output gradient at its recorded index.
    #[allow(clippy::too_many_arguments)]
    fn max_pool2d_backward_to(
        _dst: &mut Self::Storage,
        _dst_layout: &Layout,
        _grad: &Self::Storage,
        _grad_layout: &Layout,
        _indices: &Self::Storage,
        _indices_layout: &Layout,
        _geom: &Geometry2d,
    ) -> Result<()> {
        Err(Error::unimplemented("max_pool2d_backward", Self::backend_name()))
    }

    /// Mean over the non-padding positions of each window.
    fn avg_pool2d_to(
        _dst: &mut Self::Storage,
        _dst_layout: &Layout,
        _src: &Self::Storage,
        _src_layout: &Layout,
        _geom: &Geometry2d,
    ) -> Result<()> {
        Err(Error::unimplemented("avg_pool2d", Self::backend_name()))
    }

    /// Clears `dst` then spreads each output gradient evenly over the
    /// non-padding positions of its window.
    fn avg_pool2d_backward_to(
        _dst: &mut Self::Storage,
        _dst_layout: &Layout,
        _grad: &Self::Storage,
        _grad_layout: &Layout,
        _geom: &Geometry2d,
    ) -> Result<()> {
        Err(Error::unimplemented("avg_pool2d_backward", Self::backend_name()))
    }

    /// Adaptive average pooling; output size is taken from `dst_layout`.
    fn adaptive_avg_pool2d_to(
        _dst: &mut Self::Storage,
        _dst_layout: &Layout,
        _src: &Self::Storage,
        _src_layout: &Layout,
    ) -> Result<()> {
        Err(Error::unimplemented("adaptive_avg_pool2d", Self::backend_name()))
    }

    /// Backward of adaptive average pooling; input size is taken from `dst_layout`.
    fn adaptive_avg_pool2d_backward_to(
        _dst: &mut Self::Storage,
        _dst_layout: &Layout,
        _grad: &Self::Storage,
        _grad_layout: &Layout,
    ) -> Result<()> {
        Err(Error::unimplemented(
            "adaptive_avg_pool2d_backward",
            Self::backend_name(),
        ))
    }
}

/// A complete backend: every capability trait implemented.
pub trait Backend: StorageOps + ElementwiseOps + ReduceOps + LinalgOps + SpatialOps {}

impl<T> Backend for T where T: StorageOps + ElementwiseOps + ReduceOps + LinalgOps + SpatialOps {}
