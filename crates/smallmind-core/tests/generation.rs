//! End-to-end generation tests against a tiny synthetic model.
//!
//! There is no network access and no bundled GGUF/SMQ fixture here, so this
//! builds a minimal all-F32 [`ModelWeights`] directly (one layer, four-wide
//! embeddings, a five-token vocabulary) and drives it through
//! [`GenerationSession`] exactly as a real loaded model would be.

use std::sync::Arc;
use std::time::Duration;

use smallmind_core::config::{EngineOptions, SamplingOptions};
use smallmind_core::model::loader::LoadedModel;
use smallmind_core::model::{LayerWeights, MlpKind, ModelConfig, ModelWeights, PositionEncoding};
use smallmind_core::session::{GenerationSession, StopReason};
use smallmind_core::tokenizer::{BpeMode, BpeTokenizer, Vocab};
use smallmind_kernels::{QuantTag, QuantizedTensor};

const EMBED_DIM: usize = 4;
const NUM_HEADS: usize = 2;
const HEAD_DIM: usize = 2;
const MLP_HIDDEN: usize = 8;

fn f32_tensor(shape: Vec<usize>, values: Vec<f32>) -> QuantizedTensor {
    let raw: Vec<u8> = values.iter().flat_map(|f| f.to_le_bytes()).collect();
    QuantizedTensor::new(QuantTag::F32, 1, shape, std::sync::Arc::new(raw)).unwrap()
}

/// Fills a `[rows, cols]` matrix with small, deterministic, non-degenerate
/// values so RMSNorm and attention never divide by zero.
fn filled(rows: usize, cols: usize, seed: f32) -> QuantizedTensor {
    let values: Vec<f32> = (0..rows * cols)
        .map(|i| 0.05 + seed * 0.01 * ((i % 7) as f32))
        .collect();
    f32_tensor(vec![rows, cols], values)
}

fn tiny_vocab() -> Vocab {
    Vocab::new(vec!["a".into(), "b".into(), "c".into(), " ".into(), "!".into()])
}

fn tiny_tokenizer() -> BpeTokenizer {
    BpeTokenizer::new(tiny_vocab(), vec![], BpeMode::Classic, Some(r"(?s).")).unwrap()
}

fn tiny_model() -> ModelWeights {
    let vocab_size = 5;
    let config = ModelConfig {
        vocab_size,
        max_context: 16,
        embed_dim: EMBED_DIM,
        num_heads: NUM_HEADS,
        num_kv_heads: NUM_HEADS,
        head_dim: HEAD_DIM,
        num_layers: 1,
        mlp_hidden: MLP_HIDDEN,
        norm_eps: 1e-5,
        rope_base: 10000.0,
        mlp_kind: MlpKind::GeluFfn,
        position_encoding: PositionEncoding::Rope,
        bos_token_id: None,
        eos_token_id: None,
    };
    config.validate().unwrap();

    let layer = LayerWeights {
        attn_norm: filled(1, EMBED_DIM, 1.0),
        wq: filled(NUM_HEADS * HEAD_DIM, EMBED_DIM, 2.0),
        wk: filled(NUM_HEADS * HEAD_DIM, EMBED_DIM, 3.0),
        wv: filled(NUM_HEADS * HEAD_DIM, EMBED_DIM, 4.0),
        wo: filled(EMBED_DIM, NUM_HEADS * HEAD_DIM, 5.0),
        mlp_norm: filled(1, EMBED_DIM, 6.0),
        mlp_up: filled(MLP_HIDDEN, EMBED_DIM, 7.0),
        mlp_gate: None,
        mlp_down: filled(EMBED_DIM, MLP_HIDDEN, 8.0),
    };

    ModelWeights {
        config,
        token_embedding: filled(vocab_size, EMBED_DIM, 9.0),
        position_embedding: None,
        layers: vec![layer],
        final_norm: filled(1, EMBED_DIM, 10.0),
        unembedding: filled(vocab_size, EMBED_DIM, 11.0),
    }
}

fn engine_options() -> EngineOptions {
    EngineOptions {
        model_path: "unused".into(),
        max_context_tokens: 16,
        enable_kv_cache: true,
        allow_gguf_import: false,
        request_timeout: Duration::from_secs(5),
        num_threads: 0,
        quant_dequant_block_size_override: None,
    }
}

fn loaded_model() -> Arc<LoadedModel> {
    Arc::new(LoadedModel {
        weights: tiny_model(),
        tokenizer: tiny_tokenizer(),
    })
}

#[test]
fn greedy_generation_is_deterministic_and_bounded() {
    let model = loaded_model();
    let options = engine_options();
    let mut session = GenerationSession::new(model, &options, None).unwrap();

    let sampling = SamplingOptions {
        max_new_tokens: 5,
        temperature: 0.0,
        ..SamplingOptions::default()
    };

    let (first_text, first_stats) = session.generate("ab", &sampling, &|| false).unwrap();
    session.reset();
    let (second_text, second_stats) = session.generate("ab", &sampling, &|| false).unwrap();

    assert_eq!(first_text, second_text);
    assert_eq!(first_stats.generated_tokens, second_stats.generated_tokens);
    assert!(first_stats.generated_tokens <= 5);
    assert_eq!(first_stats.prompt_tokens, 2);
}

#[test]
fn seeded_sampling_is_reproducible_across_sessions() {
    let options = engine_options();
    let sampling = SamplingOptions {
        max_new_tokens: 4,
        temperature: 0.9,
        top_p: 0.9,
        seed: Some(7),
        ..SamplingOptions::default()
    };

    let mut session_a = GenerationSession::new(loaded_model(), &options, None).unwrap();
    let (text_a, _) = session_a.generate("a", &sampling, &|| false).unwrap();

    let mut session_b = GenerationSession::new(loaded_model(), &options, None).unwrap();
    let (text_b, _) = session_b.generate("a", &sampling, &|| false).unwrap();

    assert_eq!(text_a, text_b);
}

#[test]
fn cancel_before_first_step_yields_cancelled_with_no_tokens() {
    let model = loaded_model();
    let options = engine_options();
    let mut session = GenerationSession::new(model, &options, None).unwrap();

    let sampling = SamplingOptions {
        max_new_tokens: 5,
        temperature: 0.0,
        ..SamplingOptions::default()
    };

    let (text, stats) = session.generate("a", &sampling, &|| true).unwrap();
    assert_eq!(text, "");
    assert_eq!(stats.generated_tokens, 0);
    assert_eq!(stats.stop_reason, StopReason::Cancelled);
}

#[test]
fn prompt_longer_than_context_is_rejected() {
    let model = loaded_model();
    let options = engine_options();
    let mut session = GenerationSession::new(model, &options, None).unwrap();
    let sampling = SamplingOptions::default();

    let long_prompt = "a".repeat(64);
    let err = session.generate(&long_prompt, &sampling, &|| false).unwrap_err();
    assert!(matches!(err, smallmind_core::EngineError::ContextOverflow(_)));
}

#[test]
fn stop_token_ends_generation_early() {
    let model = loaded_model();
    let options = engine_options();
    let mut session = GenerationSession::new(model, &options, None).unwrap();

    // Whatever the greedy argmax picks first, declare it a stop token so the
    // session must end after exactly one generated token.
    let probe_sampling = SamplingOptions {
        max_new_tokens: 1,
        temperature: 0.0,
        ..SamplingOptions::default()
    };
    let (_, probe_stats) = session.generate("a", &probe_sampling, &|| false).unwrap();
    assert_eq!(probe_stats.generated_tokens, 1);

    session.reset();
    let first_token_id = {
        let mut observed = None;
        session
            .generate_streaming(
                "a",
                &SamplingOptions {
                    max_new_tokens: 1,
                    temperature: 0.0,
                    ..SamplingOptions::default()
                },
                &|| false,
                |tok| observed = Some(tok.token_id),
            )
            .unwrap();
        observed.unwrap()
    };

    session.reset();
    let sampling = SamplingOptions {
        max_new_tokens: 5,
        temperature: 0.0,
        stop_token_ids: vec![first_token_id],
        ..SamplingOptions::default()
    };
    let (_, stats) = session.generate("a", &sampling, &|| false).unwrap();
    assert_eq!(stats.generated_tokens, 1);
    assert_eq!(stats.stop_reason, StopReason::StopToken);
}

#[test]
fn snapshot_restored_into_a_fresh_session_continues_identically() {
    let options = engine_options();
    let sampling = SamplingOptions {
        max_new_tokens: 1,
        temperature: 0.0,
        ..SamplingOptions::default()
    };

    // Run prefill on one session and capture its KV cache right after.
    let mut baseline = GenerationSession::new(loaded_model(), &options, None).unwrap();
    let (_, baseline_stats) = baseline.generate("ab", &sampling, &|| false).unwrap();
    assert_eq!(baseline_stats.generated_tokens, 1);
    let snapshot = baseline.snapshot().unwrap();
    assert_eq!(snapshot.len(), 3); // two prompt tokens plus the one generated

    // Continue the baseline session with a new turn, without resetting.
    let mut continued_text = String::new();
    baseline
        .generate_streaming("c", &sampling, &|| false, |tok| continued_text.push_str(&tok.token_text))
        .unwrap();

    // Restore the snapshot into a brand-new session and take the same turn.
    let mut restored = GenerationSession::new(loaded_model(), &options, None).unwrap();
    restored.restore(&snapshot).unwrap();
    let mut restored_text = String::new();
    restored
        .generate_streaming("c", &sampling, &|| false, |tok| restored_text.push_str(&tok.token_text))
        .unwrap();

    assert_eq!(continued_text, restored_text);
}
