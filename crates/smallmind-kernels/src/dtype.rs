//! Block-quantization tags and the canonical GGUF/SMQ byte layouts for each.
//!
//! Every dequantization routine here mirrors the bit-level layout `llama.cpp`
//! / GGUF defines for these types (superblock structure, packed scale/min
//! bit-widths), since §3 of the design requires the canonical byte layout to
//! be reproduced exactly for GGUF interoperability.

use half::f16;

use crate::KernelError;

/// Quantization tag for a stored tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(non_camel_case_types)]
pub enum QuantTag {
    /// 32-bit IEEE float, unquantized.
    #[default]
    F32,
    /// 8-bit symmetric, one `f16` scale per block.
    Q8_0,
    /// 4-bit symmetric, one `f16` scale per block.
    Q4_0,
    /// 5-bit symmetric, one `f16` scale plus a packed high-bit word per block.
    Q5_0,
    /// 4-bit k-quant: 256-element superblock, 8 sub-blocks of 32 with 6-bit
    /// scales and 6-bit mins.
    Q4_K,
    /// 6-bit k-quant: 256-element superblock, 4-bit low + 2-bit high codes
    /// with 8-bit per-sub-block scales.
    Q6_K,
}

/// Byte size of the packed 6-bit scale/min table in a [`QuantTag::Q4_K`]
/// superblock (8 scales + 8 mins, 6 bits each, packed into 12 bytes).
const Q4_K_SCALE_BYTES: usize = 12;

impl QuantTag {
    /// Whether this tag represents a quantized (as opposed to plain float)
    /// storage format.
    pub fn is_quantized(self) -> bool {
        !matches!(self, QuantTag::F32)
    }

    /// The block size (in elements) this tag is canonically stored with when
    /// no override is given. GGUF uses 32-element blocks for the legacy
    /// formats and 256-element superblocks for k-quants; SMQ may override the
    /// legacy formats to 64 (see [`crate::QuantizedTensor`]).
    pub fn canonical_block_size(self) -> usize {
        match self {
            QuantTag::F32 => 1,
            QuantTag::Q8_0 | QuantTag::Q4_0 | QuantTag::Q5_0 => 32,
            QuantTag::Q4_K | QuantTag::Q6_K => 256,
        }
    }

    /// Whether `block_size` is an acceptable override for this tag. K-quants
    /// have a fixed superblock structure and cannot be resized; the legacy
    /// formats accept either the GGUF (32) or SMQ (64) block size.
    pub fn accepts_block_size(self, block_size: usize) -> bool {
        match self {
            QuantTag::F32 => block_size == 1,
            QuantTag::Q8_0 | QuantTag::Q4_0 => block_size == 32 || block_size == 64,
            QuantTag::Q5_0 => block_size == 32,
            QuantTag::Q4_K | QuantTag::Q6_K => block_size == 256,
        }
    }

    /// Size, in bytes, of one block of `block_size` elements.
    pub fn bytes_per_block(self, block_size: usize) -> usize {
        match self {
            QuantTag::F32 => 4 * block_size,
            QuantTag::Q8_0 => 2 + block_size,
            QuantTag::Q4_0 => 2 + block_size / 2,
            QuantTag::Q5_0 => 2 + 4 + block_size / 2,
            QuantTag::Q4_K => 2 + 2 + Q4_K_SCALE_BYTES + block_size / 2,
            QuantTag::Q6_K => block_size / 2 + block_size / 4 + block_size / 16 + 2,
        }
    }
}

/// Dequantize `n_elements` elements starting at element offset `start` of a
/// tensor whose raw codes are `data`, writing the result into `out`.
///
/// `block_size` must satisfy [`QuantTag::accepts_block_size`]; `start` and
/// `start + n_elements` must fall on block boundaries, which holds for every
/// call site in this crate (row-aligned gathers and GEMM panels).
pub fn dequantize_range(
    tag: QuantTag,
    data: &[u8],
    block_size: usize,
    start: usize,
    out: &mut [f32],
) -> Result<(), KernelError> {
    if start % block_size != 0 || out.len() % block_size != 0 {
        return Err(KernelError::ShapeMismatch(format!(
            "dequantize range [{start}, {}) is not block-aligned to block_size {block_size}",
            start + out.len()
        )));
    }
    let bytes_per_block = tag.bytes_per_block(block_size);
    let start_block = start / block_size;
    let n_blocks = out.len() / block_size;
    let byte_start = start_block * bytes_per_block;
    let byte_len = n_blocks * bytes_per_block;
    let chunk = data.get(byte_start..byte_start + byte_len).ok_or_else(|| {
        KernelError::InvalidModel(format!(
            "tensor data too short: need {} bytes at offset {byte_start}, have {}",
            byte_len,
            data.len()
        ))
    })?;

    for (block_idx, block_bytes) in chunk.chunks_exact(bytes_per_block).enumerate() {
        let out_block = &mut out[block_idx * block_size..(block_idx + 1) * block_size];
        dequantize_block(tag, block_bytes, block_size, out_block)?;
    }
    Ok(())
}

fn dequantize_block(
    tag: QuantTag,
    block: &[u8],
    block_size: usize,
    out: &mut [f32],
) -> Result<(), KernelError> {
    match tag {
        QuantTag::F32 => {
            for (o, b) in out.iter_mut().zip(block.chunks_exact(4)) {
                *o = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            }
        }
        QuantTag::Q8_0 => dequant_q8_0(block, out),
        QuantTag::Q4_0 => dequant_q4_0(block, out),
        QuantTag::Q5_0 => dequant_q5_0(block, out),
        QuantTag::Q4_K => dequant_q4_k(block, out),
        QuantTag::Q6_K => dequant_q6_k(block, out),
    }
    let _ = block_size;
    Ok(())
}

fn read_f16(bytes: &[u8]) -> f32 {
    f16::from_le_bytes([bytes[0], bytes[1]]).to_f32()
}

fn dequant_q8_0(block: &[u8], out: &mut [f32]) {
    let d = read_f16(&block[0..2]);
    let codes = &block[2..];
    for (o, &c) in out.iter_mut().zip(codes.iter()) {
        *o = d * (c as i8) as f32;
    }
}

fn dequant_q4_0(block: &[u8], out: &mut [f32]) {
    let d = read_f16(&block[0..2]);
    let codes = &block[2..];
    let n = out.len();
    for i in 0..n / 2 {
        let byte = codes[i];
        let lo = (byte & 0x0F) as i32 - 8;
        let hi = (byte >> 4) as i32 - 8;
        out[i] = d * lo as f32;
        out[i + n / 2] = d * hi as f32;
    }
}

fn dequant_q5_0(block: &[u8], out: &mut [f32]) {
    let d = read_f16(&block[0..2]);
    let qh = u32::from_le_bytes([block[2], block[3], block[4], block[5]]);
    let codes = &block[6..];
    let n = out.len();
    let half = n / 2;
    for j in 0..half {
        let xh_0 = (((qh >> j) << 4) & 0x10) as u8;
        let xh_1 = ((qh >> (j + 12)) & 0x10) as u8;
        let x0 = ((codes[j] & 0x0F) | xh_0) as i32 - 16;
        let x1 = ((codes[j] >> 4) | xh_1) as i32 - 16;
        out[j] = d * x0 as f32;
        out[j + half] = d * x1 as f32;
    }
}

/// Unpack the 6-bit (scale, min) pair at sub-block index `j` from a Q4_K
/// superblock's packed 12-byte scale table, per the canonical GGUF bit
/// layout (8 scales followed by 8 mins, interleaved into 6-bit lanes).
fn get_scale_min_k4(j: usize, q: &[u8]) -> (u8, u8) {
    if j < 4 {
        (q[j] & 63, q[j + 4] & 63)
    } else {
        let d = (q[j + 4] & 0x0F) | ((q[j - 4] >> 6) << 4);
        let m = (q[j + 4] >> 4) | ((q[j] >> 6) << 4);
        (d, m)
    }
}

fn dequant_q4_k(block: &[u8], out: &mut [f32]) {
    let d = read_f16(&block[0..2]);
    let dmin = read_f16(&block[2..4]);
    let scales = &block[4..4 + Q4_K_SCALE_BYTES];
    let qs = &block[4 + Q4_K_SCALE_BYTES..];

    let mut y = 0usize;
    let mut q_off = 0usize;
    let mut is = 0usize;
    while y < 256 {
        let (sc1, m1) = get_scale_min_k4(is, scales);
        let d1 = d * sc1 as f32;
        let min1 = dmin * m1 as f32;
        let (sc2, m2) = get_scale_min_k4(is + 1, scales);
        let d2 = d * sc2 as f32;
        let min2 = dmin * m2 as f32;

        for l in 0..32 {
            out[y + l] = d1 * (qs[q_off + l] & 0x0F) as f32 - min1;
        }
        for l in 0..32 {
            out[y + 32 + l] = d2 * (qs[q_off + l] >> 4) as f32 - min2;
        }

        y += 64;
        q_off += 32;
        is += 2;
    }
}

fn dequant_q6_k(block: &[u8], out: &mut [f32]) {
    let ql = &block[0..128];
    let qh = &block[128..128 + 64];
    let scales = &block[128 + 64..128 + 64 + 16];
    let d = read_f16(&block[128 + 64 + 16..128 + 64 + 16 + 2]);

    let mut y = 0usize;
    let mut ql_off = 0usize;
    let mut qh_off = 0usize;
    let mut sc_off = 0usize;
    while y < 256 {
        for l in 0..32 {
            let is = l / 16;
            let q1 = (((ql[ql_off + l] & 0x0F) | (((qh[qh_off + l] >> 0) & 3) << 4)) as i32) - 32;
            let q2 =
                (((ql[ql_off + l + 32] & 0x0F) | (((qh[qh_off + l] >> 2) & 3) << 4)) as i32) - 32;
            let q3 = (((ql[ql_off + l] >> 4) | (((qh[qh_off + l] >> 4) & 3) << 4)) as i32) - 32;
            let q4 =
                (((ql[ql_off + l + 32] >> 4) | (((qh[qh_off + l] >> 6) & 3) << 4)) as i32) - 32;

            out[y + l] = d * scales[sc_off + is] as i8 as f32 * q1 as f32;
            out[y + 32 + l] = d * scales[sc_off + is + 2] as i8 as f32 * q2 as f32;
            out[y + 64 + l] = d * scales[sc_off + is + 4] as i8 as f32 * q3 as f32;
            out[y + 96 + l] = d * scales[sc_off + is + 6] as i8 as f32 * q4 as f32;
        }
        y += 128;
        ql_off += 64;
        qh_off += 32;
        sc_off += 8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn q4_0_round_trip_symmetric_codes() {
        // scale = 1.0, codes alternate 0 and 15 (i.e. -8 and +7 after centering).
        let mut block = vec![0u8; QuantTag::Q4_0.bytes_per_block(32)];
        block[0..2].copy_from_slice(&f16::from_f32(1.0).to_le_bytes());
        for b in block[2..].iter_mut() {
            *b = 0xF0; // hi nibble 15 (-> 7), lo nibble 0 (-> -8)
        }
        let mut out = vec![0f32; 32];
        dequantize_range(QuantTag::Q4_0, &block, 32, 0, &mut out).unwrap();
        assert!(out[0..16].iter().all(|&v| v == -8.0));
        assert!(out[16..32].iter().all(|&v| v == 7.0));
    }

    #[test]
    fn q8_0_dequant_matches_scale() {
        let mut block = vec![0u8; QuantTag::Q8_0.bytes_per_block(32)];
        block[0..2].copy_from_slice(&f16::from_f32(0.5).to_le_bytes());
        block[2] = 4i8.to_le_bytes()[0];
        let mut out = vec![0f32; 32];
        dequantize_range(QuantTag::Q8_0, &block, 32, 0, &mut out).unwrap();
        assert_eq!(out[0], 2.0);
    }

    #[test]
    fn q4_k_superblock_has_canonical_size() {
        assert_eq!(QuantTag::Q4_K.bytes_per_block(256), 144);
    }

    #[test]
    fn q6_k_superblock_has_canonical_size() {
        assert_eq!(QuantTag::Q6_K.bytes_per_block(256), 210);
    }

    #[test]
    fn q6_k_all_zero_scales_dequantize_to_zero() {
        let block = vec![0u8; QuantTag::Q6_K.bytes_per_block(256)];
        let mut out = vec![1f32; 256];
        dequantize_range(QuantTag::Q6_K, &block, 256, 0, &mut out).unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn misaligned_range_is_rejected() {
        let block = vec![0u8; QuantTag::Q4_0.bytes_per_block(32)];
        let mut out = vec![0f32; 16];
        assert!(dequantize_range(QuantTag::Q4_0, &block, 32, 3, &mut out).is_err());
    }
}
