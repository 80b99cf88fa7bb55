//! # marten-nn
//!
//! Layers for Marten with forward and backward passes that write into
//! buffers allocated once, at `init`, and reused every step.
//!
//! 1. **Layer trait** — `init(shape)`, then `forward()` / `backward()`
//! 2. **Dense** — fully connected: `y = xWᵀ + b`
//! 3. **Conv1d / Conv2d** — im2col convolution with all three gradients
//! 4. **Pooling** — max, average, global average and adaptive average
//! 5. **Activations** — ReLU, Sigmoid, Tanh, Softmax with fused gradients
//! 6. **Lstm** — a single LSTM cell with carried hidden and cell state
//! 7. **Shape layers** — Flatten, Reshape, Squeeze, Unsqueeze, Transpose, Pad
//! 8. **Dropout** — random zeroing while training, identity at inference
//! 9. **Sequential**, **init** and the MSE and cross-entropy **losses**
//!
//! Layers are generic over `Backend`, so the same network definition works
//! on any backend implementing the capability set.

pub mod activation;
pub mod conv;
pub mod dense;
pub mod dropout;
pub mod flatten;
pub mod init;
pub mod layer;
pub mod loss;
pub mod lstm;
pub mod pad;
pub mod pool;
pub mod reshape;
pub mod sequential;

pub use activation::{ReLU, Sigmoid, Softmax, Tanh};
pub use conv::{Conv1d, Conv2d};
pub use dense::Dense;
pub use dropout::Dropout;
pub use flatten::Flatten;
pub use init::FanMode;
pub use layer::Layer;
pub use loss::{
    categorical_cross_entropy_grad_to, categorical_cross_entropy_loss, cross_entropy_grad_to,
    cross_entropy_loss, mse_grad_to, mse_loss,
};
pub use lstm::Lstm;
pub use pad::Pad;
pub use pool::{AdaptiveAvgPool2d, AvgPool2d, GlobalAvgPool2d, MaxPool2d};
pub use reshape::{Reshape, Squeeze, Transpose, Unsqueeze};
pub use sequential::Sequential;
