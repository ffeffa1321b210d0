use crate::shape::BlobShape;

/// Which copy of a buffer an operation was touching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySide {
    Host,
    Device,
}

impl std::fmt::Display for MemorySide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemorySide::Host => write!(f, "host"),
            MemorySide::Device => write!(f, "device"),
        }
    }
}

/// All errors that can occur within caffeine.
///
/// The first four variants are the failure modes of the storage and layer
/// contracts: shape mismatches found at setup, illegal dimensions passed to
/// reshape, device access without an accelerator, and allocation failure.
/// None of them are retried; callers treat them as a hard stop for the
/// current computation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A layer was given the wrong number of blobs, or blobs whose shapes it
    /// cannot work with.
    #[error("shape mismatch in {layer}: {reason}")]
    ShapeMismatch { layer: String, reason: String },

    /// Negative or overflowing dimensions passed to `reshape`.
    #[error("invalid shape {dims:?}: dimensions must be non-negative and the element count must fit in memory")]
    InvalidShape { dims: [i64; 4] },

    /// Device-side storage was requested but no accelerator is attached.
    #[error("no accelerator device is available")]
    DeviceUnavailable,

    /// Host or device memory exhaustion.
    #[error("failed to allocate {bytes} bytes on {side}: {reason}")]
    AllocationFailure {
        bytes: usize,
        side: MemorySide,
        reason: String,
    },

    /// Forward or Backward was called before `set_up`.
    #[error("layer {layer} used before set_up")]
    NotSetUp { layer: String },

    /// A layer or filler option is missing, has the wrong type, or is out of range.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// A dtype that the receiving side cannot handle.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Driver or kernel failure reported by an accelerator.
    #[error("device error: {0}")]
    Device(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn shape_mismatch(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            layer: layer.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Shape mismatch between two blobs that must agree element for element.
    pub fn blob_mismatch(layer: impl Into<String>, expected: &BlobShape, got: &BlobShape) -> Self {
        Error::ShapeMismatch {
            layer: layer.into(),
            reason: format!("expected {expected}, got {got}"),
        }
    }
}

/// Convenience Result type used throughout caffeine.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
