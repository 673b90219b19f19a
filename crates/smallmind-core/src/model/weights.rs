//! Flat per-layer weight record and the whole-model container.
//!
//! This is the data-oriented alternative to a `Layer`/`Block`/`Model` class
//! hierarchy: one struct per layer holding exactly the tensors a forward pass
//! needs, and a free function in [`crate::forward`] that consumes it.

use smallmind_kernels::QuantizedTensor;

use super::{MlpKind, ModelConfig, PositionEncoding};

/// One decoder layer's weights.
pub struct LayerWeights {
    /// Pre-attention RMSNorm gain.
    pub attn_norm: QuantizedTensor,
    /// Query projection, shape `[num_heads * head_dim, embed_dim]`.
    pub wq: QuantizedTensor,
    /// Key projection, shape `[num_kv_heads * head_dim, embed_dim]`.
    pub wk: QuantizedTensor,
    /// Value projection, shape `[num_kv_heads * head_dim, embed_dim]`.
    pub wv: QuantizedTensor,
    /// Output projection, shape `[embed_dim, num_heads * head_dim]`.
    pub wo: QuantizedTensor,
    /// Pre-MLP RMSNorm gain.
    pub mlp_norm: QuantizedTensor,
    /// MLP up projection (`gelu_ffn`) or up branch (`swiglu`).
    pub mlp_up: QuantizedTensor,
    /// MLP gate branch; only present for `swiglu`.
    pub mlp_gate: Option<QuantizedTensor>,
    /// MLP down projection, mapping `mlp_hidden -> embed_dim`.
    pub mlp_down: QuantizedTensor,
}

/// A fully loaded model: static configuration, per-layer weights, and the
/// global embedding/unembedding/norm tensors.
pub struct ModelWeights {
    /// Architecture configuration.
    pub config: ModelConfig,
    /// Token embedding table, shape `[vocab_size, embed_dim]`.
    pub token_embedding: QuantizedTensor,
    /// Additive absolute position embedding table, present only when
    /// `config.position_encoding == PositionEncoding::AdditiveAbsolute`.
    pub position_embedding: Option<QuantizedTensor>,
    /// Per-layer weights, in layer order.
    pub layers: Vec<LayerWeights>,
    /// Final RMSNorm gain applied before unembedding.
    pub final_norm: QuantizedTensor,
    /// Unembedding projection, shape `[vocab_size, embed_dim]`.
    pub unembedding: QuantizedTensor,
}

impl ModelWeights {
    /// Whether this model's MLP blocks carry a gate branch.
    pub fn is_swiglu(&self) -> bool {
        self.config.mlp_kind == MlpKind::SwiGlu
    }

    /// Whether this model uses RoPE rather than additive position embeddings.
    pub fn uses_rope(&self) -> bool {
        self.config.position_encoding == PositionEncoding::Rope
    }
}
