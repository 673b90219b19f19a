//! SMQ: the native model container.
//!
//! Layout: an 8-byte magic `"SMALLMND"`, a fixed header giving the byte
//! offsets of a JSON metadata blob and a tensor directory, followed by the
//! tensor data regions themselves. The JSON manifest duplicates the
//! directory (for human inspection and SHA-256 integrity checking) but the
//! binary directory is authoritative for offsets.
//!
//! [`write`] is the inverse of [`parse`]: it copies each tensor's block
//! codes verbatim (no requantization) into this layout, which is how
//! `import-gguf` produces an SMQ file from a loaded GGUF model.

use std::convert::TryInto;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smallmind_kernels::{QuantTag, QuantizedTensor};

use super::{MlpKind, ModelWeights, PositionEncoding};
use crate::error::{EngineError, Result};

const SMQ_MAGIC: &[u8; 8] = b"SMALLMND";

/// Static model dimensions carried in the manifest, independent of any one
/// tensor's layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestModelDims {
    /// Number of decoder layers.
    pub num_layers: usize,
    /// Model (embedding) dimension.
    pub hidden_dim: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Maximum context length the model was built for.
    pub context_length: usize,
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of key/value heads.
    pub num_kv_heads: usize,
    /// Per-head dimension.
    pub head_dim: usize,
    /// RoPE base frequency.
    pub rope_base: f32,
    /// RMSNorm epsilon.
    pub norm_eps: f32,
    /// Feed-forward block kind (`"gelu_ffn"` or `"swiglu"`).
    pub mlp_kind: String,
    /// Position encoding style (`"rope"` or `"additive_absolute"`). Older
    /// manifests predate this field and default to `"rope"`.
    #[serde(default = "default_position_encoding")]
    pub position_encoding: String,
}

fn default_position_encoding() -> String {
    "rope".to_string()
}

/// The SMQ sidecar manifest, JSON-encoded and embedded in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmqManifest {
    /// Container format version.
    pub format_version: u32,
    /// Human-readable model name.
    pub model_name: String,
    /// ISO-8601 creation timestamp.
    pub created_utc: String,
    /// Number of tensors in the directory.
    pub tensor_count: usize,
    /// Quantization scheme names present among the tensors.
    pub quant_schemes: Vec<String>,
    /// Static model dimensions.
    pub model_dims: ManifestModelDims,
    /// SHA-256 digest over the concatenated tensor data regions, in
    /// directory order.
    pub sha256_blob: String,
}

/// One directory entry describing a tensor's storage within the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmqDirectoryEntry {
    /// Tensor name.
    pub name: String,
    /// Quantization scheme name (maps to a [`QuantTag`] via [`quant_tag_from_dtype`]).
    pub dtype: String,
    /// Logical row-major shape.
    pub shape: Vec<usize>,
    /// Byte offset of the tensor's block codes within the file.
    pub data_offset: u64,
    /// Byte length of the tensor's block codes.
    pub data_bytes: u64,
    /// Byte offset of an out-of-band scales table, if present.
    #[serde(default)]
    pub scales_offset: u64,
    /// Byte length of the scales table.
    #[serde(default)]
    pub scales_bytes: u64,
    /// Byte offset of an out-of-band zero-point table, if present.
    #[serde(default)]
    pub zp_offset: u64,
    /// Byte length of the zero-point table.
    #[serde(default)]
    pub zp_bytes: u64,
    /// Block size the tensor's codes are packed with.
    pub block_size: usize,
}

/// A parsed SMQ file: manifest, directory, and the raw bytes (so directory
/// offsets can be sliced directly).
pub struct SmqFile<'a> {
    /// The JSON sidecar manifest.
    pub manifest: SmqManifest,
    /// Per-tensor storage directory.
    pub directory: Vec<SmqDirectoryEntry>,
    /// The full file contents, for slicing directory offsets against.
    pub data: &'a [u8],
}

fn quant_tag_from_dtype(dtype: &str) -> Result<QuantTag> {
    match dtype {
        "f32" => Ok(QuantTag::F32),
        "q8_0" => Ok(QuantTag::Q8_0),
        "q4_0" => Ok(QuantTag::Q4_0),
        "q5_0" => Ok(QuantTag::Q5_0),
        "q4_k" => Ok(QuantTag::Q4_K),
        "q6_k" => Ok(QuantTag::Q6_K),
        other => Err(EngineError::UnsupportedConversion(format!(
            "unknown SMQ dtype '{other}'"
        ))),
    }
}

fn dtype_from_quant_tag(tag: QuantTag) -> &'static str {
    match tag {
        QuantTag::F32 => "f32",
        QuantTag::Q8_0 => "q8_0",
        QuantTag::Q4_0 => "q4_0",
        QuantTag::Q5_0 => "q5_0",
        QuantTag::Q4_K => "q4_k",
        QuantTag::Q6_K => "q6_k",
    }
}

/// One named tensor to be written into an SMQ container, in directory order.
pub struct WriteTensor<'a> {
    /// Tensor name, matching the naming scheme the loader expects back.
    pub name: String,
    /// The tensor's raw block codes and metadata.
    pub tensor: &'a QuantizedTensor,
}

/// Lay out `weights` under the plain (non-GGUF) tensor names [`super::loader`]
/// expects back from an SMQ file, and derive the matching manifest dims.
///
/// Returned tensors borrow from `weights`, so the result must be passed to
/// [`write`] before `weights` is dropped.
pub fn tensors_from_weights(weights: &ModelWeights) -> (ManifestModelDims, Vec<WriteTensor<'_>>) {
    let cfg = &weights.config;
    let model_dims = ManifestModelDims {
        num_layers: cfg.num_layers,
        hidden_dim: cfg.embed_dim,
        vocab_size: cfg.vocab_size,
        context_length: cfg.max_context,
        num_heads: cfg.num_heads,
        num_kv_heads: cfg.num_kv_heads,
        head_dim: cfg.head_dim,
        rope_base: cfg.rope_base,
        norm_eps: cfg.norm_eps,
        mlp_kind: match cfg.mlp_kind {
            MlpKind::GeluFfn => "gelu_ffn".to_string(),
            MlpKind::SwiGlu => "swiglu".to_string(),
        },
        position_encoding: match cfg.position_encoding {
            PositionEncoding::Rope => "rope".to_string(),
            PositionEncoding::AdditiveAbsolute => "additive_absolute".to_string(),
        },
    };

    let mut tensors = vec![
        WriteTensor {
            name: "token_embedding".into(),
            tensor: &weights.token_embedding,
        },
        WriteTensor {
            name: "final_norm".into(),
            tensor: &weights.final_norm,
        },
        WriteTensor {
            name: "unembedding".into(),
            tensor: &weights.unembedding,
        },
    ];
    if let Some(pos_embed) = &weights.position_embedding {
        tensors.push(WriteTensor {
            name: "position_embedding".into(),
            tensor: pos_embed,
        });
    }
    for (i, layer) in weights.layers.iter().enumerate() {
        tensors.push(WriteTensor {
            name: format!("layer.{i}.attn_norm"),
            tensor: &layer.attn_norm,
        });
        tensors.push(WriteTensor {
            name: format!("layer.{i}.attn_q"),
            tensor: &layer.wq,
        });
        tensors.push(WriteTensor {
            name: format!("layer.{i}.attn_k"),
            tensor: &layer.wk,
        });
        tensors.push(WriteTensor {
            name: format!("layer.{i}.attn_v"),
            tensor: &layer.wv,
        });
        tensors.push(WriteTensor {
            name: format!("layer.{i}.attn_output"),
            tensor: &layer.wo,
        });
        tensors.push(WriteTensor {
            name: format!("layer.{i}.mlp_norm"),
            tensor: &layer.mlp_norm,
        });
        tensors.push(WriteTensor {
            name: format!("layer.{i}.mlp_up"),
            tensor: &layer.mlp_up,
        });
        if let Some(gate) = &layer.mlp_gate {
            tensors.push(WriteTensor {
                name: format!("layer.{i}.mlp_gate"),
                tensor: gate,
            });
        }
        tensors.push(WriteTensor {
            name: format!("layer.{i}.mlp_down"),
            tensor: &layer.mlp_down,
        });
    }

    (model_dims, tensors)
}

/// Serialize `tensors` plus `model_dims` into one SMQ container, producing
/// the exact byte layout [`parse`] and [`verify_integrity`] expect: header,
/// metadata JSON, tensor data blobs in directory order, directory JSON.
pub fn write(model_name: &str, created_utc: &str, model_dims: ManifestModelDims, tensors: &[WriteTensor<'_>]) -> Vec<u8> {
    let mut quant_schemes: Vec<String> = tensors
        .iter()
        .map(|t| dtype_from_quant_tag(t.tensor.tag()).to_string())
        .collect();
    quant_schemes.sort();
    quant_schemes.dedup();

    let header_len = 8 + 4 + 4 + 8 + 8 + 8;

    let mut hasher = Sha256::new();
    let mut directory = Vec::with_capacity(tensors.len());
    let mut data_blob = Vec::new();
    for t in tensors {
        let bytes = t.tensor.raw_bytes();
        hasher.update(bytes);
        directory.push(SmqDirectoryEntry {
            name: t.name.clone(),
            dtype: dtype_from_quant_tag(t.tensor.tag()).to_string(),
            shape: t.tensor.shape().to_vec(),
            data_offset: 0, // relative; patched below to absolute
            data_bytes: bytes.len() as u64,
            scales_offset: 0,
            scales_bytes: 0,
            zp_offset: 0,
            zp_bytes: 0,
            block_size: t.tensor.block_size(),
        });
        data_blob.extend_from_slice(bytes);
    }
    let sha256_blob = format!("{:x}", hasher.finalize());

    let manifest = SmqManifest {
        format_version: 1,
        model_name: model_name.to_string(),
        created_utc: created_utc.to_string(),
        tensor_count: tensors.len(),
        quant_schemes,
        model_dims,
        sha256_blob,
    };
    let metadata_json = serde_json::to_vec(&manifest).expect("SmqManifest always serializes");
    let metadata_offset = header_len;
    let data_offset = metadata_offset + metadata_json.len();

    let mut running = data_offset as u64;
    for entry in &mut directory {
        entry.data_offset = running;
        running += entry.data_bytes;
    }

    let directory_json = serde_json::to_vec(&directory).expect("SmqDirectoryEntry always serializes");
    let directory_offset = data_offset + data_blob.len();

    let mut buf = Vec::with_capacity(directory_offset + directory_json.len());
    buf.extend_from_slice(SMQ_MAGIC);
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&(metadata_offset as u64).to_le_bytes());
    buf.extend_from_slice(&(directory_offset as u64).to_le_bytes());
    let file_size_pos = buf.len();
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&metadata_json);
    buf.extend_from_slice(&data_blob);
    buf.extend_from_slice(&directory_json);

    let total_len = buf.len() as u64;
    buf[file_size_pos..file_size_pos + 8].copy_from_slice(&total_len.to_le_bytes());
    buf
}

/// Parse an SMQ file's header, manifest, and tensor directory out of `data`.
pub fn parse(data: &[u8]) -> Result<SmqFile<'_>> {
    if data.len() < 8 + 4 + 4 + 8 + 8 + 8 {
        return Err(EngineError::InvalidModel("SMQ file too short for header".into()));
    }
    if &data[0..8] != SMQ_MAGIC {
        return Err(EngineError::InvalidModel("missing SMQ magic".into()));
    }
    let mut off = 8;
    let read_u32 = |d: &[u8], o: usize| u32::from_le_bytes(d[o..o + 4].try_into().unwrap());
    let read_u64 = |d: &[u8], o: usize| u64::from_le_bytes(d[o..o + 8].try_into().unwrap());

    let _format_version = read_u32(data, off);
    off += 4;
    let _flags = read_u32(data, off);
    off += 4;
    let metadata_offset = read_u64(data, off) as usize;
    off += 8;
    let directory_offset = read_u64(data, off) as usize;
    off += 8;
    let file_size = read_u64(data, off) as usize;
    if file_size != data.len() {
        return Err(EngineError::IntegrityError(format!(
            "SMQ header declares file_size {file_size} but file is {} bytes",
            data.len()
        )));
    }

    let metadata_len = directory_offset
        .checked_sub(metadata_offset)
        .ok_or_else(|| EngineError::InvalidModel("SMQ directory precedes metadata".into()))?;
    let metadata_bytes = data
        .get(metadata_offset..metadata_offset + metadata_len)
        .ok_or_else(|| EngineError::InvalidModel("SMQ metadata region out of bounds".into()))?;
    let manifest: SmqManifest = serde_json::from_slice(metadata_bytes)
        .map_err(|e| EngineError::InvalidModel(format!("invalid SMQ manifest JSON: {e}")))?;

    let dir_bytes = data
        .get(directory_offset..)
        .ok_or_else(|| EngineError::InvalidModel("SMQ directory offset out of bounds".into()))?;
    let directory: Vec<SmqDirectoryEntry> = serde_json::from_slice(dir_bytes)
        .map_err(|e| EngineError::InvalidModel(format!("invalid SMQ directory JSON: {e}")))?;

    if directory.len() != manifest.tensor_count {
        return Err(EngineError::IntegrityError(format!(
            "manifest declares {} tensors but directory has {}",
            manifest.tensor_count,
            directory.len()
        )));
    }

    Ok(SmqFile {
        manifest,
        directory,
        data,
    })
}

/// Verify the manifest's `sha256_blob` digest against the tensor data
/// regions named in `directory`, concatenated in directory order.
pub fn verify_integrity(file: &SmqFile<'_>) -> Result<()> {
    let mut hasher = Sha256::new();
    for entry in &file.directory {
        let start = entry.data_offset as usize;
        let end = start + entry.data_bytes as usize;
        let region = file.data.get(start..end).ok_or_else(|| {
            EngineError::InvalidModel(format!("tensor '{}' data region out of bounds", entry.name))
        })?;
        hasher.update(region);
    }
    let digest = format!("{:x}", hasher.finalize());
    if digest != file.manifest.sha256_blob {
        return Err(EngineError::IntegrityError(format!(
            "SMQ blob digest mismatch: manifest says {}, computed {digest}",
            file.manifest.sha256_blob
        )));
    }
    Ok(())
}

pub(crate) fn entry_quant_tag(entry: &SmqDirectoryEntry) -> Result<QuantTag> {
    quant_tag_from_dtype(&entry.dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_smq(tensor_bytes: &[u8]) -> Vec<u8> {
        let directory = vec![SmqDirectoryEntry {
            name: "token_embedding".into(),
            dtype: "f32".into(),
            shape: vec![2, 4],
            data_offset: 0, // relative; patched below to absolute
            data_bytes: tensor_bytes.len() as u64,
            scales_offset: 0,
            scales_bytes: 0,
            zp_offset: 0,
            zp_bytes: 0,
            block_size: 1,
        }];
        let mut hasher = Sha256::new();
        hasher.update(tensor_bytes);
        let digest = format!("{:x}", hasher.finalize());

        let manifest = SmqManifest {
            format_version: 1,
            model_name: "tiny".into(),
            created_utc: "2026-01-01T00:00:00Z".into(),
            tensor_count: 1,
            quant_schemes: vec!["f32".into()],
            model_dims: ManifestModelDims {
                num_layers: 1,
                hidden_dim: 4,
                vocab_size: 2,
                context_length: 8,
                num_heads: 1,
                num_kv_heads: 1,
                head_dim: 4,
                rope_base: 10000.0,
                norm_eps: 1e-5,
                mlp_kind: "gelu_ffn".into(),
                position_encoding: "rope".into(),
            },
            sha256_blob: digest,
        };

        let header_len = 8 + 4 + 4 + 8 + 8 + 8;
        let metadata_json = serde_json::to_vec(&manifest).unwrap();
        let metadata_offset = header_len;
        let data_offset = metadata_offset + metadata_json.len();

        let mut directory = directory;
        directory[0].data_offset = (data_offset) as u64;
        let directory_json = serde_json::to_vec(&directory).unwrap();
        let directory_offset = data_offset + tensor_bytes.len();

        let mut buf = Vec::new();
        buf.extend_from_slice(SMQ_MAGIC);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&(metadata_offset as u64).to_le_bytes());
        buf.extend_from_slice(&(directory_offset as u64).to_le_bytes());
        // placeholder file_size, patched below
        let file_size_pos = buf.len();
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&metadata_json);
        buf.extend_from_slice(tensor_bytes);
        buf.extend_from_slice(&directory_json);

        let total_len = buf.len() as u64;
        buf[file_size_pos..file_size_pos + 8].copy_from_slice(&total_len.to_le_bytes());
        buf
    }

    #[test]
    fn parses_manifest_and_directory() {
        let tensor_bytes: Vec<u8> = (0..8i32).flat_map(|i| (i as f32).to_le_bytes()).collect();
        let buf = build_smq(&tensor_bytes);
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.manifest.model_name, "tiny");
        assert_eq!(parsed.directory.len(), 1);
        verify_integrity(&parsed).unwrap();
    }

    #[test]
    fn integrity_check_fails_on_tamper() {
        let tensor_bytes: Vec<u8> = (0..8i32).flat_map(|i| (i as f32).to_le_bytes()).collect();
        let mut buf = build_smq(&tensor_bytes);
        let parsed = parse(&buf).unwrap();
        let data_offset = parsed.directory[0].data_offset as usize;
        buf[data_offset] ^= 0xFF;
        let parsed = parse(&buf).unwrap();
        assert!(verify_integrity(&parsed).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 64];
        assert!(parse(&buf).is_err());
    }

    fn dims() -> ManifestModelDims {
        ManifestModelDims {
            num_layers: 1,
            hidden_dim: 4,
            vocab_size: 2,
            context_length: 8,
            num_heads: 1,
            num_kv_heads: 1,
            head_dim: 4,
            rope_base: 10000.0,
            norm_eps: 1e-5,
            mlp_kind: "gelu_ffn".into(),
            position_encoding: "rope".into(),
        }
    }

    #[test]
    fn write_then_parse_round_trips() {
        let raw: Vec<u8> = (0..8i32).flat_map(|i| (i as f32).to_le_bytes()).collect();
        let tensor = QuantizedTensor::new(QuantTag::F32, 1, vec![2, 4], std::sync::Arc::new(raw)).unwrap();
        let tensors = vec![WriteTensor {
            name: "token_embedding".into(),
            tensor: &tensor,
        }];
        let buf = write("tiny", "2026-01-01T00:00:00Z", dims(), &tensors);

        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.manifest.model_name, "tiny");
        assert_eq!(parsed.manifest.quant_schemes, vec!["f32".to_string()]);
        assert_eq!(parsed.directory.len(), 1);
        assert_eq!(parsed.directory[0].name, "token_embedding");
        verify_integrity(&parsed).unwrap();
    }

    #[test]
    fn write_produces_recoverable_quant_tag() {
        let raw: Vec<u8> = (0..8i32).flat_map(|i| (i as f32).to_le_bytes()).collect();
        let tensor = QuantizedTensor::new(QuantTag::F32, 1, vec![2, 4], std::sync::Arc::new(raw)).unwrap();
        let tensors = vec![WriteTensor {
            name: "token_embedding".into(),
            tensor: &tensor,
        }];
        let buf = write("tiny", "2026-01-01T00:00:00Z", dims(), &tensors);
        let parsed = parse(&buf).unwrap();
        let tag = entry_quant_tag(&parsed.directory[0]).unwrap();
        assert_eq!(tag, QuantTag::F32);
    }
}
