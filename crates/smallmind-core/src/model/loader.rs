//! Top-level model loading: detects GGUF vs SMQ by magic, parses the
//! container, validates declared shapes against the architecture, and
//! materializes tensors as zero-copy views into a memory map.

use std::fs::File;
use std::sync::Arc;

use memmap2::Mmap;
use smallmind_kernels::{QuantTag, QuantizedTensor, TensorStore};

use super::gguf::{self, MetadataValue};
use super::smq;
use super::{LayerWeights, MlpKind, ModelConfig, ModelWeights, PositionEncoding};
use crate::config::EngineOptions;
use crate::error::{EngineError, Result};
use crate::tokenizer::{BpeMode, BpeTokenizer, Vocab};

/// Everything a loaded model needs to serve generation: weights and the
/// tokenizer built from the same file.
pub struct LoadedModel {
    /// Architecture configuration and per-layer tensors.
    pub weights: ModelWeights,
    /// The tokenizer built from the same file.
    pub tokenizer: BpeTokenizer,
}

/// Load a model from `options.model_path`, dispatching on the file's magic
/// bytes to the GGUF or SMQ parser.
pub fn load_model(options: &EngineOptions) -> Result<LoadedModel> {
    let file = File::open(&options.model_path)
        .map_err(|e| EngineError::InvalidModel(format!("cannot open model file: {e}")))?;
    let mmap = unsafe {
        Mmap::map(&file).map_err(|e| EngineError::InvalidModel(format!("cannot map model file: {e}")))?
    };
    if mmap.len() >= 4 && &mmap[0..4] == b"GGUF" {
        if !options.allow_gguf_import {
            return Err(EngineError::ValidationError(
                "GGUF import is disabled by engine options".into(),
            ));
        }
        load_gguf(mmap, options)
    } else if mmap.len() >= 8 && &mmap[0..8] == b"SMALLMND" {
        load_smq(mmap, options)
    } else {
        Err(EngineError::InvalidModel(
            "file is neither GGUF nor SMQ (unrecognized magic)".into(),
        ))
    }
}

fn meta_u32(meta: &std::collections::HashMap<String, MetadataValue>, key: &str) -> Result<u32> {
    meta.get(key)
        .and_then(MetadataValue::as_u32)
        .ok_or_else(|| EngineError::InvalidModel(format!("missing or malformed metadata key '{key}'")))
}

fn meta_f32_or(meta: &std::collections::HashMap<String, MetadataValue>, key: &str, default: f32) -> f32 {
    meta.get(key).and_then(MetadataValue::as_f32).unwrap_or(default)
}

fn load_gguf(mmap: Mmap, options: &EngineOptions) -> Result<LoadedModel> {
    let parsed = gguf::parse(&mmap)?;
    let arch = parsed
        .metadata
        .get("general.architecture")
        .and_then(MetadataValue::as_str)
        .unwrap_or("llama")
        .to_string();

    let prefix = |suffix: &str| format!("{arch}.{suffix}");
    let embed_dim = meta_u32(&parsed.metadata, &prefix("embedding_length"))? as usize;
    let num_layers = meta_u32(&parsed.metadata, &prefix("block_count"))? as usize;
    let num_heads = meta_u32(&parsed.metadata, &prefix("attention.head_count"))? as usize;
    let num_kv_heads = parsed
        .metadata
        .get(&prefix("attention.head_count_kv"))
        .and_then(MetadataValue::as_u32)
        .map(|v| v as usize)
        .unwrap_or(num_heads);
    let max_context = meta_u32(&parsed.metadata, &prefix("context_length"))? as usize;
    let mlp_hidden = meta_u32(&parsed.metadata, &prefix("feed_forward_length"))? as usize;
    let norm_eps = meta_f32_or(&parsed.metadata, &prefix("attention.layer_norm_rms_epsilon"), 1e-5);
    let rope_base = meta_f32_or(&parsed.metadata, &prefix("rope.freq_base"), 10000.0);
    let vocab_size = meta_u32(&parsed.metadata, &prefix("vocab_size"))
        .unwrap_or_else(|_| {
            parsed
                .metadata
                .get("tokenizer.ggml.tokens")
                .and_then(MetadataValue::as_array)
                .map(|a| a.len() as u32)
                .unwrap_or(0)
        }) as usize;

    let mlp_kind = if parsed.metadata.contains_key(&prefix("expert_count"))
        || has_tensor(&parsed.tensors, "ffn_gate")
    {
        MlpKind::SwiGlu
    } else {
        MlpKind::GeluFfn
    };

    let position_encoding = if arch == "gpt2" {
        PositionEncoding::AdditiveAbsolute
    } else {
        PositionEncoding::Rope
    };

    if num_heads == 0 || num_kv_heads == 0 || embed_dim % num_heads != 0 {
        return Err(EngineError::UnsupportedArchitecture(format!(
            "architecture '{arch}' declares an inconsistent head layout"
        )));
    }
    let head_dim = embed_dim / num_heads;

    let bos_token_id = parsed
        .metadata
        .get("tokenizer.ggml.bos_token_id")
        .and_then(MetadataValue::as_u32);
    let eos_token_id = parsed
        .metadata
        .get("tokenizer.ggml.eos_token_id")
        .and_then(MetadataValue::as_u32);

    let config = ModelConfig {
        vocab_size,
        max_context: options.max_context_tokens.min(max_context).max(1),
        embed_dim,
        num_heads,
        num_kv_heads,
        head_dim,
        num_layers,
        mlp_hidden,
        norm_eps,
        rope_base,
        mlp_kind,
        position_encoding,
        bos_token_id,
        eos_token_id,
    };
    config.validate()?;

    let mmap = Arc::new(mmap);
    let mut store = TensorStore::new();
    let default_block_size = options.quant_dequant_block_size_override.unwrap_or(32);
    for entry in &parsed.tensors {
        let tag = gguf::quant_tag_for_type_code(entry.type_code)?;
        let block_size = if tag == QuantTag::Q4_K || tag == QuantTag::Q6_K {
            256
        } else if tag == QuantTag::F32 {
            1
        } else {
            default_block_size
        };
        let shape: Vec<usize> = entry.dims.iter().rev().copied().collect();
        let abs_offset = parsed.data_start + entry.offset;
        let byte_source = MmapSlice {
            mmap: mmap.clone(),
            start: abs_offset as usize,
        };
        let tensor = QuantizedTensor::new(tag, block_size, shape, Arc::new(byte_source))?;
        store.insert(entry.name.clone(), tensor);
    }

    let weights = assemble_weights(config, &store, gguf_tensor_names)?;
    let tokenizer = build_gguf_tokenizer(&parsed.metadata)?;

    Ok(LoadedModel { weights, tokenizer })
}

fn load_smq(mmap: Mmap, options: &EngineOptions) -> Result<LoadedModel> {
    let mmap = Arc::new(mmap);
    let parsed = smq::parse(&mmap)?;
    smq::verify_integrity(&parsed)?;

    let dims = &parsed.manifest.model_dims;
    let mlp_kind = match dims.mlp_kind.as_str() {
        "swiglu" => MlpKind::SwiGlu,
        "gelu_ffn" => MlpKind::GeluFfn,
        other => {
            return Err(EngineError::UnsupportedArchitecture(format!(
                "unknown SMQ mlp_kind '{other}'"
            )))
        }
    };
    let config = ModelConfig {
        vocab_size: dims.vocab_size,
        max_context: options.max_context_tokens.min(dims.context_length).max(1),
        embed_dim: dims.hidden_dim,
        num_heads: dims.num_heads,
        num_kv_heads: dims.num_kv_heads,
        head_dim: dims.head_dim,
        num_layers: dims.num_layers,
        mlp_hidden: dims.hidden_dim * 4,
        norm_eps: dims.norm_eps,
        rope_base: dims.rope_base,
        mlp_kind,
        position_encoding: match dims.position_encoding.as_str() {
            "additive_absolute" => PositionEncoding::AdditiveAbsolute,
            _ => PositionEncoding::Rope,
        },
        bos_token_id: None,
        eos_token_id: None,
    };
    config.validate()?;

    let mut store = TensorStore::new();
    for entry in &parsed.directory {
        let tag = smq::entry_quant_tag(entry)?;
        let byte_source = MmapSlice {
            mmap: mmap.clone(),
            start: entry.data_offset as usize,
        };
        let tensor = QuantizedTensor::new(tag, entry.block_size, entry.shape.clone(), Arc::new(byte_source))?;
        store.insert(entry.name.clone(), tensor);
    }

    let weights = assemble_weights(config, &store, smq_tensor_names)?;

    // SMQ does not embed a tokenizer; callers supply a pre-built one for
    // SMQ models via the registry. A minimal identity tokenizer keeps
    // `load_model` total rather than partial for SMQ-only workflows
    // (e.g. `inspect`) that never call `encode`.
    let tokenizer = BpeTokenizer::new(Vocab::new(Vec::new()), Vec::new(), BpeMode::ByteLevel, Some(r"(?s)."))?;

    Ok(LoadedModel { weights, tokenizer })
}

struct TensorNameScheme {
    token_embedding: &'static str,
    position_embedding: &'static [&'static str],
    final_norm: &'static str,
    unembedding: &'static str,
    layer: fn(usize, &str) -> String,
}

fn gguf_tensor_names() -> TensorNameScheme {
    TensorNameScheme {
        token_embedding: "token_embd.weight",
        position_embedding: &["position_embd.weight", "wpe.weight", "wpe"],
        final_norm: "output_norm.weight",
        unembedding: "output.weight",
        layer: |i, suffix| format!("blk.{i}.{suffix}"),
    }
}

fn smq_tensor_names() -> TensorNameScheme {
    TensorNameScheme {
        token_embedding: "token_embedding",
        position_embedding: &["position_embedding"],
        final_norm: "final_norm",
        unembedding: "unembedding",
        layer: |i, suffix| format!("layer.{i}.{suffix}"),
    }
}

fn assemble_weights(
    config: ModelConfig,
    store: &TensorStore,
    names: fn() -> TensorNameScheme,
) -> Result<ModelWeights> {
    let names = names();
    let token_embedding = store.require(names.token_embedding)?.clone();
    let final_norm = store.require(names.final_norm)?.clone();
    let unembedding = store.require(names.unembedding)?.clone();

    let position_embedding = if config.position_encoding == PositionEncoding::AdditiveAbsolute {
        let tensor = names
            .position_embedding
            .iter()
            .find_map(|name| store.get(name))
            .ok_or_else(|| {
                EngineError::InvalidModel(
                    "architecture declares additive absolute position encoding but no position \
                     embedding tensor was found"
                        .into(),
                )
            })?;
        Some(tensor.clone())
    } else {
        None
    };

    let mut layers = Vec::with_capacity(config.num_layers);
    for i in 0..config.num_layers {
        let t = |suffix: &str| -> Result<QuantizedTensor> {
            Ok(store.require(&(names.layer)(i, suffix))?.clone())
        };
        let mlp_gate = if config.mlp_kind == MlpKind::SwiGlu {
            Some(t("ffn_gate.weight").or_else(|_| t("mlp_gate"))?)
        } else {
            None
        };
        layers.push(LayerWeights {
            attn_norm: t("attn_norm.weight").or_else(|_| t("attn_norm"))?,
            wq: t("attn_q.weight").or_else(|_| t("attn_q"))?,
            wk: t("attn_k.weight").or_else(|_| t("attn_k"))?,
            wv: t("attn_v.weight").or_else(|_| t("attn_v"))?,
            wo: t("attn_output.weight").or_else(|_| t("attn_output"))?,
            mlp_norm: t("ffn_norm.weight").or_else(|_| t("mlp_norm"))?,
            mlp_up: t("ffn_up.weight").or_else(|_| t("mlp_up"))?,
            mlp_gate,
            mlp_down: t("ffn_down.weight").or_else(|_| t("mlp_down"))?,
        });
    }

    Ok(ModelWeights {
        config,
        token_embedding,
        position_embedding,
        layers,
        final_norm,
        unembedding,
    })
}

fn build_gguf_tokenizer(meta: &std::collections::HashMap<String, MetadataValue>) -> Result<BpeTokenizer> {
    let tokens: Vec<String> = meta
        .get("tokenizer.ggml.tokens")
        .and_then(MetadataValue::as_array)
        .ok_or_else(|| EngineError::InvalidModel("GGUF file has no tokenizer.ggml.tokens".into()))?
        .iter()
        .map(|v| v.as_str().unwrap_or("").to_string())
        .collect();

    let merges: Vec<(String, String)> = meta
        .get("tokenizer.ggml.merges")
        .and_then(MetadataValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| s.split_once(' '))
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let model_name = meta
        .get("tokenizer.ggml.model")
        .and_then(MetadataValue::as_str)
        .unwrap_or("gpt2");
    let mode = if model_name == "gpt2" {
        BpeMode::ByteLevel
    } else {
        BpeMode::Classic
    };

    BpeTokenizer::new(Vocab::new(tokens), merges, mode, None)
}

fn has_tensor(tensors: &[gguf::TensorEntry], substring: &str) -> bool {
    tensors.iter().any(|t| t.name.contains(substring))
}

/// A lazily-sliced view into a memory-mapped file, starting at a fixed byte
/// offset. [`smallmind_kernels::TensorBytes`] only needs `AsRef<[u8]>`; this
/// keeps every tensor zero-copy without re-slicing the map on every access.
struct MmapSlice {
    mmap: Arc<Mmap>,
    start: usize,
}

impl AsRef<[u8]> for MmapSlice {
    fn as_ref(&self) -> &[u8] {
        &self.mmap[self.start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_tensor(shape: Vec<usize>, values: &[f32]) -> QuantizedTensor {
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        QuantizedTensor::new(QuantTag::F32, 1, shape, Arc::new(raw)).unwrap()
    }

    fn tiny_weights() -> ModelWeights {
        let config = ModelConfig {
            vocab_size: 2,
            max_context: 8,
            embed_dim: 4,
            num_heads: 1,
            num_kv_heads: 1,
            head_dim: 4,
            num_layers: 1,
            mlp_hidden: 8,
            norm_eps: 1e-5,
            rope_base: 10000.0,
            mlp_kind: MlpKind::GeluFfn,
            position_encoding: PositionEncoding::Rope,
            bos_token_id: None,
            eos_token_id: None,
        };
        let layer = LayerWeights {
            attn_norm: f32_tensor(vec![4], &[1.0; 4]),
            wq: f32_tensor(vec![4, 4], &[0.1; 16]),
            wk: f32_tensor(vec![4, 4], &[0.2; 16]),
            wv: f32_tensor(vec![4, 4], &[0.3; 16]),
            wo: f32_tensor(vec![4, 4], &[0.4; 16]),
            mlp_norm: f32_tensor(vec![4], &[1.0; 4]),
            mlp_up: f32_tensor(vec![8, 4], &[0.5; 32]),
            mlp_gate: None,
            mlp_down: f32_tensor(vec![4, 8], &[0.6; 32]),
        };
        ModelWeights {
            config,
            token_embedding: f32_tensor(vec![2, 4], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]),
            position_embedding: None,
            layers: vec![layer],
            final_norm: f32_tensor(vec![4], &[1.0; 4]),
            unembedding: f32_tensor(vec![2, 4], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]),
        }
    }

    /// The SMQ writer's naming must exactly match what `smq_tensor_names`
    /// (consumed by `assemble_weights` inside `load_smq`) looks for, or a
    /// model written by this engine couldn't be loaded back by itself.
    #[test]
    fn written_smq_reassembles_into_equivalent_weights() {
        let weights = tiny_weights();
        let (dims, write_tensors) = smq::tensors_from_weights(&weights);
        let buf = smq::write("tiny", "2026-01-01T00:00:00Z", dims, &write_tensors);

        let parsed = smq::parse(&buf).unwrap();
        smq::verify_integrity(&parsed).unwrap();

        let mut store = TensorStore::new();
        for entry in &parsed.directory {
            let tag = smq::entry_quant_tag(entry).unwrap();
            let region = &parsed.data[entry.data_offset as usize..(entry.data_offset + entry.data_bytes) as usize];
            let tensor = QuantizedTensor::new(tag, entry.block_size, entry.shape.clone(), Arc::new(region.to_vec())).unwrap();
            store.insert(entry.name.clone(), tensor);
        }

        let config = ModelConfig {
            vocab_size: parsed.manifest.model_dims.vocab_size,
            max_context: parsed.manifest.model_dims.context_length,
            embed_dim: parsed.manifest.model_dims.hidden_dim,
            num_heads: parsed.manifest.model_dims.num_heads,
            num_kv_heads: parsed.manifest.model_dims.num_kv_heads,
            head_dim: parsed.manifest.model_dims.head_dim,
            num_layers: parsed.manifest.model_dims.num_layers,
            mlp_hidden: 8,
            norm_eps: parsed.manifest.model_dims.norm_eps,
            rope_base: parsed.manifest.model_dims.rope_base,
            mlp_kind: MlpKind::GeluFfn,
            position_encoding: PositionEncoding::Rope,
            bos_token_id: None,
            eos_token_id: None,
        };
        let reassembled = assemble_weights(config, &store, smq_tensor_names).unwrap();

        let mut row = vec![0f32; 4];
        reassembled.token_embedding.dequantize_row(1, &mut row).unwrap();
        assert_eq!(row, vec![5.0, 6.0, 7.0, 8.0]);
        assert_eq!(reassembled.layers.len(), 1);
        assert!(reassembled.layers[0].mlp_gate.is_none());
    }
}
