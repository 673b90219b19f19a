//! Error kinds surfaced by every layer of the engine, transport-agnostic and
//! unified so callers can match on one type regardless of whether the
//! failure originated in the loader, the forward pass, or the session.

use thiserror::Error;

/// The single error type returned by every public `smallmind-core` operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A model file failed a structural or content invariant while loading.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// The model declares an architecture, MLP kind, or head layout this
    /// engine does not implement.
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// The loader would need to re-quantize beyond the supported tag set.
    #[error("unsupported conversion: {0}")]
    UnsupportedConversion(String),

    /// A SHA-256 digest or manifest field didn't match the data it describes.
    #[error("integrity error: {0}")]
    IntegrityError(String),

    /// Two tensors or buffers passed to a kernel have incompatible shapes.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// No kernel exists for a requested (activation dtype, weight tag) pair.
    #[error("unsupported kernel: {0}")]
    UnsupportedKernel(String),

    /// A requested context length exceeds `max_context_tokens`.
    #[error("context overflow: {0}")]
    ContextOverflow(String),

    /// An operation was attempted on a session with no loaded model.
    #[error("model not loaded")]
    ModelNotLoaded,

    /// Generation was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,

    /// The per-request timeout elapsed.
    #[error("timeout")]
    Timeout,

    /// A kernel produced non-finite output (NaN/Inf in logits or
    /// activations); the model or input is likely corrupt.
    #[error("internal kernel error: {0}")]
    InternalKernelError(String),

    /// A path, option, or manifest field failed input validation.
    #[error("validation error: {0}")]
    ValidationError(String),
}

impl From<smallmind_kernels::KernelError> for EngineError {
    fn from(e: smallmind_kernels::KernelError) -> Self {
        match e {
            smallmind_kernels::KernelError::InvalidModel(msg) => EngineError::InvalidModel(msg),
            smallmind_kernels::KernelError::ShapeMismatch(msg) => EngineError::ShapeMismatch(msg),
            smallmind_kernels::KernelError::UnsupportedKernel { weight } => {
                EngineError::UnsupportedKernel(format!("no kernel for weight tag {weight:?}"))
            }
        }
    }
}

/// Convenience alias for this crate's `Result`.
pub type Result<T> = std::result::Result<T, EngineError>;
