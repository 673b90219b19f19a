//! Model configuration and weight storage.
//!
//! [`ModelConfig`] and [`ModelWeights`] are the data-oriented replacement for
//! a per-architecture model hierarchy: one flat record per layer, one free
//! function (`crate::forward::forward_layer`) that operates on it. Adding an
//! architecture means constructing a different [`ModelConfig`], not writing
//! a new type.

pub mod gguf;
pub mod loader;
pub mod smq;
pub mod weights;

pub use loader::load_model;
pub use weights::{LayerWeights, ModelWeights};

/// Feed-forward block variant a decoder layer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlpKind {
    /// `down(GELU(up(x)))`.
    GeluFfn,
    /// `down(SiLU(gate(x)) * up(x))`.
    SwiGlu,
}

/// How position information reaches the attention computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEncoding {
    /// Rotary position embedding applied to Q/K inside attention.
    Rope,
    /// Additive absolute position embedding added to the token embedding,
    /// for legacy GPT-2-style architectures.
    AdditiveAbsolute,
}

/// Static architecture configuration, parsed once at load time.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Maximum context length this model was built/configured for.
    pub max_context: usize,
    /// Model (embedding) dimension `d`.
    pub embed_dim: usize,
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of key/value heads (≤ `num_heads`; GQA when less).
    pub num_kv_heads: usize,
    /// Per-head dimension, `embed_dim / num_heads`.
    pub head_dim: usize,
    /// Number of decoder layers.
    pub num_layers: usize,
    /// Hidden width of the MLP block.
    pub mlp_hidden: usize,
    /// RMSNorm epsilon.
    pub norm_eps: f32,
    /// RoPE base frequency.
    pub rope_base: f32,
    /// Feed-forward block variant.
    pub mlp_kind: MlpKind,
    /// Position encoding style.
    pub position_encoding: PositionEncoding,
    /// Beginning-of-sequence token id, if the model declares one.
    pub bos_token_id: Option<u32>,
    /// End-of-sequence token id, if the model declares one.
    pub eos_token_id: Option<u32>,
}

impl ModelConfig {
    /// Validate internal consistency of the declared dimensions.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::EngineError;
        if self.num_heads == 0 || self.num_kv_heads == 0 {
            return Err(EngineError::ShapeMismatch("head count must be nonzero".into()));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(EngineError::ShapeMismatch(format!(
                "num_heads {} is not a multiple of num_kv_heads {}",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.head_dim * self.num_heads != self.embed_dim {
            return Err(EngineError::ShapeMismatch(format!(
                "head_dim {} * num_heads {} != embed_dim {}",
                self.head_dim, self.num_heads, self.embed_dim
            )));
        }
        Ok(())
    }

    /// How many query heads share one KV head.
    pub fn gqa_group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }
}
