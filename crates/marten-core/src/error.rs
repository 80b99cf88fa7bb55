use crate::dtype::DType;
use crate::shape::Shape;

// Error — one error type for the whole engine
//
// The gradient engine reports five kinds of failure that callers are expected
// to tell apart (a layer may fall back on `Unimplemented` and abort on the
// rest). The remaining variants are structural errors raised by views and
// constructors.
//
// Every check that can fail runs before a destination is locked for writing,
// so an `Err` never leaves a half-written buffer behind.

/// All errors that can occur within marten.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operand shapes are incompatible for the requested op, including a
    /// failed broadcast.
    #[error("{op}: incompatible shapes {lhs} and {rhs}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    /// The caller-supplied destination cannot receive the result.
    #[error("{op}: invalid destination: {reason}")]
    InvalidDestination { op: &'static str, reason: String },

    /// A parameter combination the op does not support.
    #[error("{op}: unsupported configuration: {reason}")]
    UnsupportedConfiguration { op: &'static str, reason: String },

    /// A backward call needs state from a forward call that is absent or stale.
    #[error("{op}: missing precomputed state: {what}")]
    MissingPrecomputedState { op: String, what: String },

    /// The op exists but this variant (dtype, backend, mode) is not provided.
    #[error("{op}: not implemented for {variant}")]
    Unimplemented { op: &'static str, variant: String },

    /// Operation requires a specific rank (number of dimensions).
    #[error("{op}: rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// DType mismatch between operands.
    #[error("{op}: dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        op: &'static str,
        expected: DType,
        got: DType,
    },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Narrow/slice out of bounds.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// Tried to read a scalar from a tensor with more than one element.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication inner dimensions differ.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ or the source is strided.
    #[error("cannot reshape {src_shape} into {dst_shape}: {reason}")]
    ReshapeElementMismatch {
        src_shape: Shape,
        dst_shape: Shape,
        reason: &'static str,
    },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

/// The category of an [`Error`], for callers that branch on the failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ShapeMismatch,
    InvalidDestination,
    UnsupportedConfiguration,
    MissingPrecomputedState,
    Unimplemented,
    Structural,
    Other,
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn invalid_destination(op: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidDestination {
            op,
            reason: reason.into(),
        }
    }

    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        Error::UnsupportedConfiguration {
            op,
            reason: reason.into(),
        }
    }

    pub fn missing_state(op: impl Into<String>, what: impl Into<String>) -> Self {
        Error::MissingPrecomputedState {
            op: op.into(),
            what: what.into(),
        }
    }

    pub fn unimplemented(op: &'static str, variant: impl Into<String>) -> Self {
        Error::Unimplemented {
            op,
            variant: variant.into(),
        }
    }

    /// Which category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Error::InvalidDestination { .. } => ErrorKind::InvalidDestination,
            Error::UnsupportedConfiguration { .. } => ErrorKind::UnsupportedConfiguration,
            Error::MissingPrecomputedState { .. } => ErrorKind::MissingPrecomputedState,
            Error::Unimplemented { .. } => ErrorKind::Unimplemented,
            Error::RankMismatch { .. }
            | Error::DTypeMismatch { .. }
            | Error::DimOutOfRange { .. }
            | Error::NarrowOutOfBounds { .. }
            | Error::NotAScalar { .. }
            | Error::ElementCountMismatch { .. }
            | Error::MatmulShapeMismatch { .. }
            | Error::ReshapeElementMismatch { .. } => ErrorKind::Structural,
            Error::Msg(_) => ErrorKind::Other,
        }
    }
}

/// Convenience Result type used throughout marten.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted [`Error::Msg`].
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
