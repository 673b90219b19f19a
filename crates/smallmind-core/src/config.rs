//! Plain configuration structs passed into the engine and into each
//! generation request. These carry no behavior; validation happens where
//! the values are consumed (loader, session).

/// Engine-wide configuration, independent of any one generation request.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Path to the GGUF or SMQ model file.
    pub model_path: std::path::PathBuf,
    /// Maximum number of tokens (prompt + generated) any session may reach.
    pub max_context_tokens: usize,
    /// Whether the KV cache is used at all (disabling forces full recompute
    /// every step; present for parity with the external interface, not
    /// expected to be exercised on the hot path).
    pub enable_kv_cache: bool,
    /// Whether loading a GGUF file directly (as opposed to SMQ) is permitted.
    pub allow_gguf_import: bool,
    /// Wall-clock budget for one `generate_*` call.
    pub request_timeout: std::time::Duration,
    /// Worker thread count for the engine's pool. `0` means auto-detect via
    /// `SMALLMIND_NUM_THREADS` or `std::thread::available_parallelism()`.
    pub num_threads: usize,
    /// Overrides the dequantization block size the loader assumes when a
    /// tensor's source format doesn't declare one explicitly.
    pub quant_dequant_block_size_override: Option<usize>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            model_path: std::path::PathBuf::new(),
            max_context_tokens: 0,
            enable_kv_cache: true,
            allow_gguf_import: false,
            request_timeout: std::time::Duration::from_secs(60),
            num_threads: 0,
            quant_dequant_block_size_override: None,
        }
    }
}

impl EngineOptions {
    /// Resolve `num_threads` to a concrete worker count, honoring the
    /// `SMALLMIND_NUM_THREADS` environment variable override before falling
    /// back to the platform's detected parallelism.
    pub fn resolved_num_threads(&self) -> usize {
        if self.num_threads != 0 {
            return self.num_threads;
        }
        if let Ok(v) = std::env::var("SMALLMIND_NUM_THREADS") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    return n;
                }
            }
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Per-request sampling configuration.
#[derive(Debug, Clone)]
pub struct SamplingOptions {
    /// Maximum number of tokens to generate after the prompt.
    pub max_new_tokens: usize,
    /// Softmax temperature; `0.0` selects greedy (argmax) decoding.
    pub temperature: f32,
    /// Retain only the `top_k` highest-probability tokens. `0` disables.
    pub top_k: usize,
    /// Nucleus sampling threshold. `1.0` disables.
    pub top_p: f32,
    /// Minimum relative-probability threshold versus the mode. `0.0` disables.
    pub min_p: f32,
    /// Repetition penalty divisor/multiplier; `1.0` disables.
    pub repetition_penalty: f32,
    /// Presence penalty subtracted once per repeated token seen; `0.0` disables.
    pub presence_penalty: f32,
    /// Frequency penalty scaled by occurrence count; `0.0` disables.
    pub frequency_penalty: f32,
    /// Number of most-recent tokens considered by the penalty terms.
    pub penalty_window: usize,
    /// RNG seed. `None` draws a random seed from process entropy at session
    /// creation (losing cross-run determinism, but still deterministic
    /// within that session's lifetime).
    pub seed: Option<u64>,
    /// Token ids that, if sampled, end generation immediately.
    pub stop_token_ids: Vec<u32>,
    /// Substrings that, once the emitted text contains them, end generation.
    pub stop_strings: Vec<String>,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.0,
            repetition_penalty: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            penalty_window: 64,
            seed: None,
            stop_token_ids: Vec::new(),
            stop_strings: Vec::new(),
        }
    }
}
