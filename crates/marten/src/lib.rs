//! # Marten
//!
//! Forward and backward passes for neural-network layers, built on a
//! destination-passing gradient engine: every operation writes into a
//! caller-owned tensor instead of allocating its result.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ```rust
//! use marten::prelude::*;
//! ```
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `marten-core` | Tensor, Shape, Layout, DType, Backend traits, the `ops::*_to` engine |
//! | `marten-cpu` | CPU backend with rayon-parallel kernels |
//! | `marten-nn` | Layers (Dense, Conv, pooling, activations, LSTM, shape layers, Dropout, Sequential) and losses |

/// Re-export core types.
pub use marten_core::{
    backend::{Backend, BackendDevice, BackendStorage, BinaryOp, CmpOp, GradOp, ReduceOp, UnaryOp},
    Broadcast, BufferArena, BufferId, BufferRole, ConvGrads, ConvWorkspace, DType, Error, ErrorKind,
    Geometry2d, Layout, PoolIndices, Result, Shape, Tensor, Window2d, WithDType,
};

/// The destination-passing operation families.
pub use marten_core::ops;

/// Re-export the CPU backend.
pub use marten_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Re-export the layers.
pub mod nn {
    pub use marten_nn::*;
}

/// Convenient imports: `use marten::prelude::*;`
pub mod prelude {
    pub use crate::nn::{
        AdaptiveAvgPool2d, AvgPool2d, Conv1d, Conv2d, Dense, Dropout, Flatten, GlobalAvgPool2d,
        Layer, Lstm, MaxPool2d, Pad, ReLU, Reshape, Sequential, Sigmoid, Softmax, Squeeze, Tanh,
        Transpose, Unsqueeze,
    };
    pub use crate::{ops, CpuBackend, CpuDevice, CpuTensor, DType, Error, Result, Shape, Tensor};
}
