use crate::op::TensorId;
use crate::shape::Shape;

/// All errors that can occur within Ember.
///
/// Every failure is raised synchronously at the point of violation. Kernels
/// validate before they write, so a returned error never leaves a tensor
/// half-mutated.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Elementwise operands differ in rank or in any axis extent.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Inner dimensions of a matrix product disagree.
    #[error("dimension mismatch in {op}: {lhs} vs {rhs}")]
    DimensionMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    /// The operation is not defined for a tensor of this rank.
    #[error("unsupported operation: {op} on a tensor of rank {rank}")]
    UnsupportedOperation { op: &'static str, rank: usize },

    /// Registry lookup by an id that was never created or has been removed.
    #[error("tensor {0} not found")]
    NotFound(TensorId),

    /// A child edge tried to deliver a second gradient contribution.
    #[error("tensor {tensor} already received a gradient from child {child}")]
    DoubleBackward { tensor: TensorId, child: TensorId },

    /// A gradient tensor would require a gradient of its own.
    #[error("gradient tensor {0} cannot itself require gradients")]
    GradHasGrad(TensorId),

    /// A backward-pass precondition does not hold.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Data length differs from the element count implied by the shape.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// A shape with no axes or with a zero-length axis.
    #[error("invalid shape {0}: extents must be positive")]
    InvalidShape(Shape),

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// One operand lives on the host and the other on the device.
    #[error("backend mismatch: tensor {lhs} and tensor {rhs} live on different backends")]
    BackendMismatch { lhs: TensorId, rhs: TensorId },

    /// Device migration was requested but no device is attached.
    #[error("no compute device attached to this context")]
    NoDevice,

    /// Failure reported by a compute device.
    #[error("device error: {0}")]
    Device(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn device(s: impl Into<String>) -> Self {
        Error::Device(s.into())
    }
}

/// Convenience Result type used throughout Ember.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
