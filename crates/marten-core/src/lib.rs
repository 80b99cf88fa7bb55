//! # marten-core
//!
//! Tensor handles, shapes, backend capability traits and the
//! destination-passing gradient engine for Marten.
//!
//! This crate provides:
//! - [`Tensor`] — n-dimensional array handle with shared, lockable storage
//! - [`Shape`] / [`Layout`] / [`Broadcast`] — shapes, strides and the broadcast resolver
//! - [`DType`] — element types (F32, F64, U8, U32, I64)
//! - [`Backend`] — the capability set a tensor runtime implements
//! - [`ops`] — `*_to(dst, ..)` operation families: elementwise, reduction,
//!   matmul, fused activation gradients, convolution and pooling
//! - [`BufferArena`] — per-layer buffers allocated once and reused

pub mod arena;
pub mod backend;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod ops;
pub mod shape;
pub mod tensor;
pub mod window;

pub use arena::{BufferArena, BufferId, BufferRole};
pub use backend::{
    Backend, BackendDevice, BackendStorage, BinaryOp, CmpOp, GradOp, Operand, ReduceOp, UnaryOp,
};
pub use dtype::{DType, WithDType};
pub use error::{Error, ErrorKind, Result};
pub use layout::Layout;
pub use ops::{ConvGrads, ConvWorkspace, PoolIndices};
pub use shape::{Broadcast, Shape};
pub use tensor::Tensor;
pub use window::{Geometry2d, Window2d};
