//! GGUF file parsing.
//!
//! Mirrors the canonical GGUF binary layout: magic, version, counts, a typed
//! key/value metadata dictionary, then a tensor directory, with tensor data
//! starting at the next offset aligned to the file's declared alignment
//! (default 32 bytes). Only read support is implemented; GGUF is an
//! interchange format SmallMind consumes, never produces.

use std::collections::HashMap;
use std::convert::TryInto;

use smallmind_kernels::QuantTag;

use crate::error::{EngineError, Result};

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
const DEFAULT_ALIGNMENT: u64 = 32;

/// One decoded metadata value. GGUF's typed KV store can hold any of these,
/// including arrays of the same variants recursively.
#[derive(Debug, Clone)]
pub enum MetadataValue {
    /// Unsigned 8-bit integer.
    U8(u8),
    /// Signed 8-bit integer.
    I8(i8),
    /// Unsigned 16-bit integer.
    U16(u16),
    /// Signed 16-bit integer.
    I16(i16),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Signed 32-bit integer.
    I32(i32),
    /// 32-bit float.
    F32(f32),
    /// Boolean.
    Bool(bool),
    /// UTF-8 string.
    String(String),
    /// Array of metadata values of the same type.
    Array(Vec<MetadataValue>),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// Signed 64-bit integer.
    I64(i64),
    /// 64-bit float.
    F64(f64),
}

impl MetadataValue {
    /// Interpret this value as a `u32`, if it holds an unsigned integer type.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            MetadataValue::U8(v) => Some(*v as u32),
            MetadataValue::U16(v) => Some(*v as u32),
            MetadataValue::U32(v) => Some(*v),
            MetadataValue::U64(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Interpret this value as an `f32`.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            MetadataValue::F32(v) => Some(*v),
            MetadataValue::F64(v) => Some(*v as f32),
            _ => None,
        }
    }

    /// Interpret this value as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Interpret this value as an array of values.
    pub fn as_array(&self) -> Option<&[MetadataValue]> {
        match self {
            MetadataValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// One entry in the GGUF tensor directory.
#[derive(Debug, Clone)]
pub struct TensorEntry {
    /// Tensor name, as declared in the file.
    pub name: String,
    /// Row-major logical shape.
    pub dims: Vec<usize>,
    /// GGUF type code (see [`quant_tag_for_type_code`]).
    pub type_code: u32,
    /// Byte offset relative to `data_start`.
    pub offset: u64,
}

/// A parsed GGUF file: its metadata dictionary, tensor directory, and the
/// absolute byte offset at which tensor data begins.
pub struct GgufFile {
    /// Key/value metadata dictionary.
    pub metadata: HashMap<String, MetadataValue>,
    /// Tensor directory, in file order.
    pub tensors: Vec<TensorEntry>,
    /// Absolute byte offset at which tensor data begins.
    pub data_start: u64,
}

/// Map a GGUF type code to the tag this crate understands.
pub fn quant_tag_for_type_code(code: u32) -> Result<QuantTag> {
    match code {
        0 => Ok(QuantTag::F32),
        2 => Ok(QuantTag::Q4_0),
        6 => Ok(QuantTag::Q5_0),
        8 => Ok(QuantTag::Q8_0),
        12 => Ok(QuantTag::Q4_K),
        14 => Ok(QuantTag::Q6_K),
        other => Err(EngineError::UnsupportedConversion(format!(
            "GGUF type code {other} has no corresponding kernel tag"
        ))),
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| EngineError::InvalidModel("unexpected end of GGUF file".into()))?;
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u64()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| EngineError::InvalidModel("GGUF string is not valid UTF-8".into()))
    }

    fn value(&mut self, type_code: u32) -> Result<MetadataValue> {
        Ok(match type_code {
            0 => MetadataValue::U8(self.u8()?),
            1 => MetadataValue::I8(self.i8()?),
            2 => MetadataValue::U16(self.u16()?),
            3 => MetadataValue::I16(self.i16()?),
            4 => MetadataValue::U32(self.u32()?),
            5 => MetadataValue::I32(self.i32()?),
            6 => MetadataValue::F32(self.f32()?),
            7 => MetadataValue::Bool(self.u8()? != 0),
            8 => MetadataValue::String(self.string()?),
            9 => {
                let elem_type = self.u32()?;
                let count = self.u64()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.value(elem_type)?);
                }
                MetadataValue::Array(items)
            }
            10 => MetadataValue::U64(self.u64()?),
            11 => MetadataValue::I64(self.i64()?),
            12 => MetadataValue::F64(self.f64()?),
            other => {
                return Err(EngineError::InvalidModel(format!(
                    "unknown GGUF metadata value type {other}"
                )))
            }
        })
    }
}

/// Parse a GGUF file's metadata and tensor directory out of `data`.
///
/// `data` must cover at least the header and directory; tensor bodies are
/// addressed by offset relative to `data_start` and read lazily by the
/// caller (typically via a memory map covering the whole file).
pub fn parse(data: &[u8]) -> Result<GgufFile> {
    let mut cur = Cursor::new(data);
    let magic = cur.take(4)?;
    if magic != GGUF_MAGIC {
        return Err(EngineError::InvalidModel("missing GGUF magic".into()));
    }
    let version = cur.u32()?;
    if version < 2 {
        return Err(EngineError::InvalidModel(format!(
            "unsupported GGUF version {version}"
        )));
    }
    let tensor_count = cur.u64()? as usize;
    let metadata_kv_count = cur.u64()? as usize;

    let mut metadata = HashMap::with_capacity(metadata_kv_count);
    for _ in 0..metadata_kv_count {
        let key = cur.string()?;
        let type_code = cur.u32()?;
        let value = cur.value(type_code)?;
        metadata.insert(key, value);
    }

    let mut tensors = Vec::with_capacity(tensor_count);
    for _ in 0..tensor_count {
        let name = cur.string()?;
        let n_dims = cur.u32()? as usize;
        let mut dims = Vec::with_capacity(n_dims);
        for _ in 0..n_dims {
            dims.push(cur.u64()? as usize);
        }
        let type_code = cur.u32()?;
        let offset = cur.u64()?;
        tensors.push(TensorEntry {
            name,
            dims,
            type_code,
            offset,
        });
    }

    let alignment = metadata
        .get("general.alignment")
        .and_then(|v| v.as_u32())
        .map(|v| v as u64)
        .unwrap_or(DEFAULT_ALIGNMENT);
    let unaligned = cur.pos as u64;
    let data_start = unaligned.div_ceil(alignment) * alignment;

    Ok(GgufFile {
        metadata,
        tensors,
        data_start,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal_gguf() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(GGUF_MAGIC);
        buf.extend_from_slice(&3u32.to_le_bytes()); // version
        buf.extend_from_slice(&0u64.to_le_bytes()); // tensor_count
        buf.extend_from_slice(&1u64.to_le_bytes()); // metadata_kv_count

        let key = b"general.name";
        buf.extend_from_slice(&(key.len() as u64).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&8u32.to_le_bytes()); // type = string
        let value = b"tiny";
        buf.extend_from_slice(&(value.len() as u64).to_le_bytes());
        buf.extend_from_slice(value);
        buf
    }

    #[test]
    fn parses_minimal_header_and_metadata() {
        let buf = build_minimal_gguf();
        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.tensors.len(), 0);
        assert_eq!(
            parsed.metadata.get("general.name").unwrap().as_str(),
            Some("tiny")
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 16];
        assert!(parse(&buf).is_err());
    }

    #[test]
    fn type_code_mapping_matches_gguf_enum() {
        assert_eq!(quant_tag_for_type_code(0).unwrap(), QuantTag::F32);
        assert_eq!(quant_tag_for_type_code(12).unwrap(), QuantTag::Q4_K);
        assert!(quant_tag_for_type_code(1).is_err()); // F16, not supported as a weight tag
    }
}
