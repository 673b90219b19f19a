//! `smallmind-kernels` owns the quantized tensor representation and the
//! fused dequant+matmul / primitive SIMD kernels used by the SmallMind
//! transformer forward pass.
//!
//! Nothing in this crate touches tokenization, sampling, or the model file
//! formats — it is the numerical floor the rest of SmallMind is built on,
//! playing the same role `ggml` plays in C-backed inference runtimes, except
//! the kernels here are native Rust rather than an FFI boundary into a C
//! library.
#![deny(missing_docs)]

mod dispatch;
mod dtype;
mod error;
pub mod gemm;
pub mod primitives;
mod tensor;

pub use dispatch::{dispatch, KernelDispatch, PlatformTag};
pub use dtype::QuantTag;
pub use error::KernelError;
pub use tensor::{PackedMatrix, PackedWeight, QuantizedTensor, TensorBytes, TensorStore};

/// Number of output rows in `A` at or above which GEMM partitions work
/// across the thread pool instead of running single-threaded.
pub const ROW_PARALLEL_THRESHOLD: usize = 32;
