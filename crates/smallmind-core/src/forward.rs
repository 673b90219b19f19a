//! The decoder-only transformer forward pass.
//!
//! One flat [`LayerWeights`] record and one free function
//! (`forward_layer`) replace a `Block`/`Attention`/`Mlp` type hierarchy:
//! there is exactly one decoder architecture here, config-driven, so virtual
//! dispatch buys nothing.

use rayon::prelude::*;
use smallmind_kernels::{gemm, primitives, PackedMatrix, QuantizedTensor};

use crate::error::{EngineError, Result};
use crate::kv_cache::KvCache;
use crate::model::{LayerWeights, ModelConfig, ModelWeights};

const ATTENTION_HEAD_PARALLEL_THRESHOLD: usize = 4;

/// Gather token embeddings for `token_ids` into a `[T, embed_dim]` matrix,
/// dequantizing one row per token from the (possibly quantized) embedding table.
fn embed_tokens(table: &QuantizedTensor, token_ids: &[u32], embed_dim: usize) -> Result<PackedMatrix> {
    let mut out = PackedMatrix::zeros(token_ids.len(), embed_dim);
    for (i, &id) in token_ids.iter().enumerate() {
        table
            .dequantize_row(id as usize, out.row_mut(i))
            .map_err(EngineError::from)?;
    }
    Ok(out)
}

/// Run one decoder block in place on `x` (`[T, embed_dim]`), appending this
/// layer's K/V to `kv_cache` and reading back the full causal context.
pub fn forward_layer(
    weights: &LayerWeights,
    x: &mut PackedMatrix,
    kv_cache: &mut KvCache,
    layer_index: usize,
    config: &ModelConfig,
    pos_start: usize,
) -> Result<()> {
    let t = x.rows();
    let d = config.embed_dim;
    let hd = config.head_dim;
    let h = config.num_heads;
    let hk = config.num_kv_heads;

    let mut h1 = x.clone();
    for row in 0..t {
        primitives::rms_norm(h1.row_mut(row), &norm_gain(&weights.attn_norm)?, config.norm_eps);
    }

    let mut q = PackedMatrix::zeros(t, h * hd);
    let mut k = PackedMatrix::zeros(t, hk * hd);
    let mut v = PackedMatrix::zeros(t, hk * hd);
    gemm::matmul(&h1, &weights.wq, &mut q).map_err(EngineError::from)?;
    gemm::matmul(&h1, &weights.wk, &mut k).map_err(EngineError::from)?;
    gemm::matmul(&h1, &weights.wv, &mut v).map_err(EngineError::from)?;

    for row in 0..t {
        let pos = pos_start + row;
        let q_row = q.row_mut(row);
        for head in 0..h {
            primitives::rope_inplace(&mut q_row[head * hd..(head + 1) * hd], pos, config.rope_base);
        }
        let k_row = k.row_mut(row);
        for head in 0..hk {
            primitives::rope_inplace(&mut k_row[head * hd..(head + 1) * hd], pos, config.rope_base);
        }
    }

    kv_cache.append(layer_index, pos_start, t, k.as_slice(), v.as_slice())?;
    let view = kv_cache.view(layer_index, pos_start + t)?;
    let l = view.valid_len;

    let y = fused_causal_attention(q.as_slice(), view.k, view.v, t, l, pos_start, h, hk, hd)?;
    let y = PackedMatrix::from_vec(t, h * hd, y).map_err(EngineError::from)?;

    let mut o = PackedMatrix::zeros(t, d);
    gemm::matmul(&y, &weights.wo, &mut o).map_err(EngineError::from)?;
    primitives::add_inplace(o.as_mut_slice(), x.as_slice());

    let mut h2 = o.clone();
    for row in 0..t {
        primitives::rms_norm(h2.row_mut(row), &norm_gain(&weights.mlp_norm)?, config.norm_eps);
    }

    let mlp_out = mlp_block(weights, &h2, config)?;
    primitives::add_inplace(o.as_mut_slice(), mlp_out.as_slice());
    *x = o;
    Ok(())
}

fn norm_gain(norm: &QuantizedTensor) -> Result<Vec<f32>> {
    norm.dequantize_all().map_err(EngineError::from)
}

fn mlp_block(weights: &LayerWeights, h2: &PackedMatrix, config: &ModelConfig) -> Result<PackedMatrix> {
    let t = h2.rows();
    match (&weights.mlp_gate, config.mlp_kind) {
        (Some(gate), crate::model::MlpKind::SwiGlu) => {
            let mut gate_out = PackedMatrix::zeros(t, config.mlp_hidden);
            let mut up_out = PackedMatrix::zeros(t, config.mlp_hidden);
            gemm::matmul(h2, gate, &mut gate_out).map_err(EngineError::from)?;
            gemm::matmul(h2, &weights.mlp_up, &mut up_out).map_err(EngineError::from)?;
            primitives::silu_inplace(gate_out.as_mut_slice());
            primitives::mul_inplace(up_out.as_mut_slice(), gate_out.as_slice());
            let mut down_out = PackedMatrix::zeros(t, config.embed_dim);
            gemm::matmul(&up_out, &weights.mlp_down, &mut down_out).map_err(EngineError::from)?;
            Ok(down_out)
        }
        _ => {
            let mut up_out = PackedMatrix::zeros(t, config.mlp_hidden);
            gemm::matmul(h2, &weights.mlp_up, &mut up_out).map_err(EngineError::from)?;
            primitives::gelu_inplace(up_out.as_mut_slice());
            let mut down_out = PackedMatrix::zeros(t, config.embed_dim);
            gemm::matmul(&up_out, &weights.mlp_down, &mut down_out).map_err(EngineError::from)?;
            Ok(down_out)
        }
    }
}

const ATTENTION_QUERY_TILE: usize = 64;
const ATTENTION_KEY_TILE: usize = 64;

/// Tiled causal attention with online softmax rescaling (flash-attention
/// style): the full `T_q x L` score matrix is never materialized. Query
/// heads are broadcast over their KV-head group for GQA.
#[allow(clippy::too_many_arguments)]
fn fused_causal_attention(
    q: &[f32],
    k_cache: &[f32],
    v_cache: &[f32],
    t_q: usize,
    l: usize,
    pos_start: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
) -> Result<Vec<f32>> {
    let group = num_heads / num_kv_heads;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut out = vec![0f32; t_q * num_heads * head_dim];

    let compute_head = |head: usize, out_head: &mut [f32]| {
        let kv_head = head / group;
        for q0 in (0..t_q).step_by(ATTENTION_QUERY_TILE) {
            let q1 = (q0 + ATTENTION_QUERY_TILE).min(t_q);
            let bq = q1 - q0;
            let mut m = vec![f32::NEG_INFINITY; bq];
            let mut lsum = vec![0f32; bq];
            let mut acc = vec![0f32; bq * head_dim];

            for k0 in (0..l).step_by(ATTENTION_KEY_TILE) {
                let k1 = (k0 + ATTENTION_KEY_TILE).min(l);
                for (qi_local, qi) in (q0..q1).enumerate() {
                    let q_abs_pos = pos_start + qi;
                    let q_vec = &q[qi * num_heads * head_dim + head * head_dim..][..head_dim];

                    let mut scores = Vec::with_capacity(k1 - k0);
                    let mut row_max = f32::NEG_INFINITY;
                    for kj in k0..k1 {
                        if kj > q_abs_pos {
                            break;
                        }
                        let k_vec = &k_cache[kj * num_kv_heads * head_dim + kv_head * head_dim..][..head_dim];
                        let s: f32 = q_vec.iter().zip(k_vec.iter()).map(|(a, b)| a * b).sum::<f32>() * scale;
                        scores.push((kj, s));
                        row_max = row_max.max(s);
                    }
                    if scores.is_empty() {
                        continue;
                    }

                    let new_m = m[qi_local].max(row_max);
                    let rescale = (m[qi_local] - new_m).exp();
                    lsum[qi_local] *= rescale;
                    let acc_row = &mut acc[qi_local * head_dim..(qi_local + 1) * head_dim];
                    for v in acc_row.iter_mut() {
                        *v *= rescale;
                    }

                    for (kj, s) in scores {
                        let p = (s - new_m).exp();
                        lsum[qi_local] += p;
                        let v_vec = &v_cache[kj * num_kv_heads * head_dim + kv_head * head_dim..][..head_dim];
                        for (a, &vv) in acc_row.iter_mut().zip(v_vec.iter()) {
                            *a += p * vv;
                        }
                    }
                    m[qi_local] = new_m;
                }
            }

            for (qi_local, qi) in (q0..q1).enumerate() {
                let denom = if lsum[qi_local] > 0.0 { lsum[qi_local] } else { 1.0 };
                let src = &acc[qi_local * head_dim..(qi_local + 1) * head_dim];
                let dst = &mut out_head[qi * head_dim..(qi + 1) * head_dim];
                for (d, s) in dst.iter_mut().zip(src.iter()) {
                    *d = s / denom;
                }
            }
        }
    };

    if num_heads >= ATTENTION_HEAD_PARALLEL_THRESHOLD {
        // Head outputs are interleaved in `out` ([T, h, hd]), so each head is
        // computed into its own scratch buffer in parallel and scattered
        // back in afterward rather than chunking `out` directly.
        let heads: Vec<Vec<f32>> = (0..num_heads)
            .into_par_iter()
            .map(|head| {
                let mut buf = vec![0f32; t_q * head_dim];
                compute_head(head, &mut buf);
                buf
            })
            .collect();
        for (head, buf) in heads.into_iter().enumerate() {
            for qi in 0..t_q {
                out[qi * num_heads * head_dim + head * head_dim..][..head_dim]
                    .copy_from_slice(&buf[qi * head_dim..(qi + 1) * head_dim]);
            }
        }
    } else {
        for head in 0..num_heads {
            let mut buf = vec![0f32; t_q * head_dim];
            compute_head(head, &mut buf);
            for qi in 0..t_q {
                out[qi * num_heads * head_dim + head * head_dim..][..head_dim]
                    .copy_from_slice(&buf[qi * head_dim..(qi + 1) * head_dim]);
            }
        }
    }

    Ok(out)
}

/// Result of a forward pass: logits for the requested rows, `[rows, vocab_size]`.
pub struct ForwardOutput {
    /// Row-major `[rows, vocab_size]` logits.
    pub logits: PackedMatrix,
}

/// Run the full model over `token_ids` starting at `pos_start`, appending to
/// `kv_cache`. When `only_last_row` is set (the decode-step case), the
/// unembedding GEMM computes only the final row's logits.
pub fn forward(
    model: &ModelWeights,
    kv_cache: &mut KvCache,
    token_ids: &[u32],
    pos_start: usize,
    only_last_row: bool,
) -> Result<ForwardOutput> {
    let config = &model.config;
    if pos_start + token_ids.len() > config.max_context {
        return Err(EngineError::ContextOverflow(format!(
            "position {} exceeds max_context {}",
            pos_start + token_ids.len(),
            config.max_context
        )));
    }

    let mut x = embed_tokens(&model.token_embedding, token_ids, config.embed_dim)?;

    if config.position_encoding == crate::model::PositionEncoding::AdditiveAbsolute {
        if let Some(pos_table) = &model.position_embedding {
            for (row, x_row) in x.as_mut_slice().chunks_mut(config.embed_dim).enumerate() {
                let mut pos_row = vec![0f32; config.embed_dim];
                pos_table
                    .dequantize_row(pos_start + row, &mut pos_row)
                    .map_err(EngineError::from)?;
                primitives::add_inplace(x_row, &pos_row);
            }
        }
    }

    for (layer_index, layer) in model.layers.iter().enumerate() {
        forward_layer(layer, &mut x, kv_cache, layer_index, config, pos_start)?;
    }

    let t = x.rows();
    for row in 0..t {
        primitives::rms_norm(x.row_mut(row), &norm_gain(&model.final_norm)?, config.norm_eps);
    }

    let rows_for_logits = if only_last_row { 1 } else { t };
    let logit_input = if only_last_row && t > 0 {
        PackedMatrix::from_vec(1, config.embed_dim, x.row(t - 1).to_vec()).map_err(EngineError::from)?
    } else {
        x
    };

    let mut logits = PackedMatrix::zeros(rows_for_logits, config.vocab_size);
    gemm::matmul(&logit_input, &model.unembedding, &mut logits).map_err(EngineError::from)?;

    for v in logits.as_slice() {
        if !v.is_finite() {
            return Err(EngineError::InternalKernelError(
                "non-finite value in logits".into(),
            ));
        }
    }

    Ok(ForwardOutput { logits })
}
