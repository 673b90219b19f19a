use thiserror::Error;

use crate::QuantTag;

/// Errors raised by the quantized tensor store and the kernel layer.
///
/// These map to the "kernel / forward" row of the error table in the
/// top-level design: they bubble up through `smallmind-core`'s forward pass
/// unchanged, so callers can match on them without depending on this crate
/// directly.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A tensor's on-disk or in-memory layout violated an invariant checked
    /// at construction time (non-finite scale, wrong byte length, an
    /// unsupported quantization tag, a block layout that doesn't evenly
    /// divide the declared shape).
    #[error("invalid model tensor: {0}")]
    InvalidModel(String),

    /// Two operands of a kernel call have shapes that cannot be combined.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// No kernel is registered for the requested (activation dtype, weight
    /// quantization tag) pair.
    #[error("no kernel for weight tag {weight:?}")]
    UnsupportedKernel {
        /// The quantization tag of the weight operand that has no kernel.
        weight: QuantTag,
    },
}
