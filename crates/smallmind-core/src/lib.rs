//! Model loading, tokenization, sampling, and the generation session driver
//! for the CPU-only quantized inference engine built on `smallmind-kernels`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use smallmind_core::config::{EngineOptions, SamplingOptions};
//! use smallmind_core::model::load_model;
//! use smallmind_core::session::GenerationSession;
//!
//! let options = EngineOptions {
//!     model_path: "model.smq".into(),
//!     max_context_tokens: 2048,
//!     enable_kv_cache: true,
//!     allow_gguf_import: false,
//!     request_timeout: Duration::from_secs(30),
//!     num_threads: 0,
//!     quant_dequant_block_size_override: None,
//! };
//! let model = Arc::new(load_model(&options)?);
//! let mut session = GenerationSession::new(model, &options, None)?;
//! let (text, stats) = session.generate("Rust is a systems language because", &SamplingOptions::default(), &|| false)?;
//! println!("{text} ({} tokens, {:?})", stats.generated_tokens, stats.stop_reason);
//! # Ok::<(), smallmind_core::error::EngineError>(())
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod constraints;
pub mod error;
mod forward;
mod kv_cache;
pub mod model;
pub mod sampling;
pub mod session;
pub mod tokenizer;

pub use config::{EngineOptions, SamplingOptions};
pub use error::{EngineError, Result};
pub use forward::{forward, ForwardOutput};
pub use kv_cache::{KvCache, KvView};
pub use model::{load_model, LayerWeights, ModelConfig, ModelWeights};
pub use sampling::Sampler;
pub use session::{GeneratedToken, GenerationSession, GenerationSnapshot, GenerationStats, StopReason};
