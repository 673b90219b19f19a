//! Per-session, per-layer KV cache.
//!
//! Each layer owns two contiguous `max_context * num_kv_heads * head_dim`
//! float buffers, laid out position-major so that all heads' K (or V) at one
//! position are contiguous. This matches the cache layout `InferenceSession`
//! uses for its `memory_k`/`memory_v` buffers, generalized from one flat
//! per-session buffer to one buffer per layer so each decoder layer can be
//! written and read independently.

use crate::error::{EngineError, Result};

/// One layer's K and V storage plus its valid-length watermark.
struct LayerCache {
    k: Vec<f32>,
    v: Vec<f32>,
    valid_len: usize,
}

impl LayerCache {
    fn new(max_context: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        let cap = max_context * num_kv_heads * head_dim;
        Self {
            k: vec![0.0; cap],
            v: vec![0.0; cap],
            valid_len: 0,
        }
    }
}

/// Read-only view over a contiguous range of cached K/V entries.
pub struct KvView<'a> {
    /// K entries for positions `[0, valid_len)`, row-major `[pos, kv_head, head_dim]`.
    pub k: &'a [f32],
    /// V entries, same layout as `k`.
    pub v: &'a [f32],
    /// Number of valid positions represented by `k` and `v`.
    pub valid_len: usize,
}

/// KV cache spanning all decoder layers for one generation session.
pub struct KvCache {
    layers: Vec<LayerCache>,
    max_context: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl KvCache {
    /// Allocate a cache for `num_layers` layers, each sized for
    /// `max_context` positions of `num_kv_heads` heads of `head_dim` floats.
    pub fn new(num_layers: usize, max_context: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        let layers = (0..num_layers)
            .map(|_| LayerCache::new(max_context, num_kv_heads, head_dim))
            .collect();
        Self {
            layers,
            max_context,
            num_kv_heads,
            head_dim,
        }
    }

    /// Maximum number of positions this cache can hold.
    pub fn max_context(&self) -> usize {
        self.max_context
    }

    /// Current valid length for `layer` (all layers advance together in
    /// normal operation, but the API is per-layer to match the append call).
    pub fn valid_len(&self, layer: usize) -> usize {
        self.layers[layer].valid_len
    }

    /// Write K/V for `t` new positions starting at `pos_start` into `layer`.
    ///
    /// `k` and `v` must each have `t * num_kv_heads * head_dim` elements in
    /// `[pos, kv_head, head_dim]` order.
    pub fn append(&mut self, layer: usize, pos_start: usize, t: usize, k: &[f32], v: &[f32]) -> Result<()> {
        let row_stride = self.num_kv_heads * self.head_dim;
        let expected = t * row_stride;
        if k.len() != expected || v.len() != expected {
            return Err(EngineError::ShapeMismatch(format!(
                "kv append expected {expected} elements per buffer, got k={}, v={}",
                k.len(),
                v.len()
            )));
        }
        if pos_start + t > self.max_context {
            return Err(EngineError::ContextOverflow(format!(
                "kv append would write position {} beyond max_context {}",
                pos_start + t,
                self.max_context
            )));
        }
        let cache = &mut self.layers[layer];
        let byte_start = pos_start * row_stride;
        cache.k[byte_start..byte_start + expected].copy_from_slice(k);
        cache.v[byte_start..byte_start + expected].copy_from_slice(v);
        cache.valid_len = cache.valid_len.max(pos_start + t);
        Ok(())
    }

    /// Borrow the valid `[0, pos_end)` range of `layer`'s K and V buffers.
    pub fn view(&self, layer: usize, pos_end: usize) -> Result<KvView<'_>> {
        let cache = &self.layers[layer];
        if pos_end > cache.valid_len {
            return Err(EngineError::ShapeMismatch(format!(
                "requested view up to position {pos_end} but only {} positions are valid",
                cache.valid_len
            )));
        }
        let row_stride = self.num_kv_heads * self.head_dim;
        let len = pos_end * row_stride;
        Ok(KvView {
            k: &cache.k[..len],
            v: &cache.v[..len],
            valid_len: pos_end,
        })
    }

    /// Reset one layer's valid length to zero, or every layer if `layer` is `None`.
    pub fn reset(&mut self, layer: Option<usize>) {
        match layer {
            Some(l) => self.layers[l].valid_len = 0,
            None => {
                for l in &mut self.layers {
                    l.valid_len = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_view_round_trips() {
        let mut cache = KvCache::new(1, 8, 2, 4);
        let k: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let v: Vec<f32> = (0..16).map(|i| -(i as f32)).collect();
        cache.append(0, 0, 2, &k, &v).unwrap();
        let view = cache.view(0, 2).unwrap();
        assert_eq!(view.k, k.as_slice());
        assert_eq!(view.v, v.as_slice());
        assert_eq!(view.valid_len, 2);
    }

    #[test]
    fn append_beyond_max_context_errors() {
        let mut cache = KvCache::new(1, 4, 1, 2);
        let k = vec![0.0; 2 * 3];
        let v = vec![0.0; 2 * 3];
        assert!(cache.append(0, 3, 3, &k, &v).is_err());
    }

    #[test]
    fn reset_clears_valid_length() {
        let mut cache = KvCache::new(1, 4, 1, 2);
        let buf = vec![0.0; 2];
        cache.append(0, 0, 1, &buf, &buf).unwrap();
        assert_eq!(cache.valid_len(0), 1);
        cache.reset(Some(0));
        assert_eq!(cache.valid_len(0), 0);
    }

    #[test]
    fn view_beyond_valid_len_errors() {
        let cache = KvCache::new(1, 4, 1, 2);
        assert!(cache.view(0, 1).is_err());
    }
}
