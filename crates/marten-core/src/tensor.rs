use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::ops;
use crate::shape::Shape;

// Tensor — a shared handle over backend storage
//
// MEMORY MODEL:
//
//   Tensor { inner: Arc<TensorInner> }
//   TensorInner { storage: Arc<RwLock<Storage>>, layout, dtype, device }
//
//   Cloning a Tensor copies an Arc. Views (reshape, transpose, permute,
//   narrow, unsqueeze, broadcast_as) build a new TensorInner around the same
//   storage Arc with a different layout, so a view and its source always
//   observe each other's writes.
//
// MUTATION:
//
//   Tensors are written only through the destination-passing ops in `ops`.
//   Those take the destination by shared reference and acquire the storage
//   write lock for the duration of one kernel. Before locking they compare
//   storage identity with every source (`shares_storage`) so a tensor can
//   never be read-locked and write-locked by the same call.
//
// The allocating helpers at the bottom of this file (`add`, `matmul`, ...)
// create a fresh destination and forward to the `_to` form. They are for
// fixtures and setup code; layers use the `_to` forms on buffers they
// allocated during initialisation.

struct TensorInner<B: Backend> {
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
}

/// An n-dimensional array on a specific backend.
///
/// # Example
/// ```ignore
/// use marten_core::{DType, Tensor};
/// use marten_cpu::{CpuBackend, CpuDevice};
///
/// let a = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32, &CpuDevice)?;
/// let dst = Tensor::<CpuBackend>::zeros((2, 2), DType::F32, &CpuDevice)?;
/// marten_core::ops::add_to(&dst, &a, &a)?;
/// ```
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={:?})",
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    fn from_storage(storage: B::Storage, layout: Layout, device: B::Device) -> Self {
        let dtype = crate::backend::BackendStorage::dtype(&storage);
        Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
            }),
        }
    }

    fn view_with_layout(&self, layout: Layout) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
            }),
        }
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// Whether both handles read and write the same storage buffer.
    pub fn shares_storage(&self, other: &Tensor<B>) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    /// Read access to the raw storage (for backend-specific inspection).
    pub fn storage(&self) -> Result<RwLockReadGuard<'_, B::Storage>> {
        self.read_storage()
    }

    pub(crate) fn read_storage(&self) -> Result<RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    pub(crate) fn write_storage(&self) -> Result<RwLockWriteGuard<'_, B::Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    // Creation

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(shape, 1.0, dtype, device)
    }

    pub fn full(shape: impl Into<Shape>, val: f64, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    /// Create a tensor from host data in row-major order.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    /// Values drawn uniformly from [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    /// Values drawn from N(0, 1).
    pub fn randn(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_normal(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    /// A zero-filled tensor with this tensor's shape, dtype and device.
    pub fn zeros_like(&self) -> Result<Self> {
        Self::zeros(self.shape().clone(), self.dtype(), self.device())
    }

    // Views

    /// Reinterpret with a new shape. Requires a dense layout.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let layout = self.layout().reshape(shape.into())?;
        Ok(self.view_with_layout(layout))
    }

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let layout = self.layout().transpose(dim0, dim1)?;
        Ok(self.view_with_layout(layout))
    }

    /// Transpose of a rank-2 tensor.
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                op: "t",
                expected: 2,
                got: self.rank(),
            });
        }
        self.transpose(0, 1)
    }

    pub fn permute(&self, order: &[usize]) -> Result<Self> {
        let layout = self.layout().permute(order)?;
        Ok(self.view_with_layout(layout))
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let layout = self.layout().narrow(dim, start, len)?;
        Ok(self.view_with_layout(layout))
    }

    /// Insert a size-1 dimension at `dim`. Works on any layout.
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim > rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.layout().strides().to_vec();
        let stride = if dim < rank { dims[dim] * strides[dim] } else { 1 };
        dims.insert(dim, 1);
        strides.insert(dim, stride);
        Ok(self.view_with_layout(Layout::new(
            Shape::new(dims),
            strides,
            self.layout().offset(),
        )))
    }

    /// View as `shape` by repeating size-1 dims with stride 0. Read-only use:
    /// a broadcast view is rejected as a destination.
    pub fn broadcast_as(&self, shape: impl Into<Shape>) -> Result<Self> {
        let layout = self.layout().broadcast_as(&shape.into())?;
        Ok(self.view_with_layout(layout))
    }

    // Host transfer

    /// Copy the logical contents into a `Vec<f64>`.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.read_storage()?;
        B::to_f64_vec(&storage, self.layout())
    }

    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        Ok(self.to_f64_vec()?[0])
    }

    // Allocating conveniences

    /// Dense copy of this tensor.
    pub fn contiguous(&self) -> Result<Self> {
        let dst = self.zeros_like()?;
        ops::copy_to(&dst, self)?;
        Ok(dst)
    }

    fn binary(&self, op: BinaryOp, rhs: &Self) -> Result<Self> {
        let shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let dst = Self::zeros(shape, self.dtype(), self.device())?;
        ops::binary_to(op, &dst, self, rhs)?;
        Ok(dst)
    }

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Mul, rhs)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Div, rhs)
    }

    fn unary(&self, op: UnaryOp) -> Result<Self> {
        let dst = self.zeros_like()?;
        ops::unary_to(op, &dst, self)?;
        Ok(dst)
    }

    pub fn neg(&self) -> Result<Self> {
        self.unary(UnaryOp::Neg)
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary(UnaryOp::Exp)
    }

    pub fn square(&self) -> Result<Self> {
        self.unary(UnaryOp::Square)
    }

    pub fn relu(&self) -> Result<Self> {
        self.unary(UnaryOp::Relu)
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.unary(UnaryOp::Sigmoid)
    }

    pub fn tanh(&self) -> Result<Self> {
        self.unary(UnaryOp::Tanh)
    }

    /// `self * mul + add`.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let dst = self.zeros_like()?;
        ops::affine_to(&dst, self, mul, add)?;
        Ok(dst)
    }

    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        let (m, n) = (self.dims().first().copied(), rhs.dims().get(1).copied());
        let (m, n) = match (m, n) {
            (Some(m), Some(n)) => (m, n),
            _ => {
                return Err(Error::RankMismatch {
                    op: "matmul",
                    expected: 2,
                    got: self.rank().min(rhs.rank()),
                })
            }
        };
        let dst = Self::zeros((m, n), self.dtype(), self.device())?;
        ops::matmul_to(&dst, self, rhs)?;
        Ok(dst)
    }

    fn reduce(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Self> {
        let shape = ops::reduced_shape(self.shape(), dims, keep_dim)?;
        let dst = Self::zeros(shape, self.dtype(), self.device())?;
        ops::reduce_to(op, &dst, self, dims, keep_dim)?;
        Ok(dst)
    }

    pub fn sum(&self, dims: &[usize], keep_dim: bool) -> Result<Self> {
        self.reduce(ReduceOp::Sum, dims, keep_dim)
    }

    pub fn mean(&self, dims: &[usize], keep_dim: bool) -> Result<Self> {
        self.reduce(ReduceOp::Mean, dims, keep_dim)
    }

    /// Sum of every element as a scalar tensor.
    pub fn sum_all(&self) -> Result<Self> {
        let dims: Vec<usize> = (0..self.rank()).collect();
        self.reduce(ReduceOp::Sum, &dims, false)
    }

    pub fn softmax(&self, dim: usize) -> Result<Self> {
        let dst = self.zeros_like()?;
        ops::softmax_to(&dst, self, dim)?;
        Ok(dst)
    }
}
