//! Generation session: owns a model reference, KV cache, sampler, and
//! optional constraint, and drives the prefill/decode loop.
//!
//! Uses a synchronous `infer(..., callback)` shape rather than an async
//! stream: nothing else in this workspace pulls in an async runtime, and the
//! callback form gives the same "stop early" control a caller needs without
//! one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::config::{EngineOptions, SamplingOptions};
use crate::constraints::Constraint;
use crate::error::{EngineError, Result};
use crate::forward;
use crate::kv_cache::KvCache;
use crate::model::loader::LoadedModel;
use crate::sampling::Sampler;

/// Why generation stopped, in the fixed priority order the session checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The caller's cancel signal (or the request timeout) fired.
    Cancelled,
    /// The sampled token id was in `stop_token_ids`.
    StopToken,
    /// The emitted text came to contain one of `stop_strings`.
    StopString,
    /// The active constraint reported a complete match.
    ConstraintComplete,
    /// `max_new_tokens` was reached without any other stop condition.
    MaxNewTokens,
}

/// One streamed generation event.
pub struct GeneratedToken {
    /// The sampled token id.
    pub token_id: u32,
    /// That token's decoded text.
    pub token_text: String,
    /// Whether this is the last event of the stream.
    pub is_final: bool,
    /// Present only on the final event.
    pub stop_reason: Option<StopReason>,
}

/// Summary returned once a `generate_*` call completes.
#[derive(Debug)]
pub struct GenerationStats {
    /// Number of prompt tokens consumed during prefill.
    pub prompt_tokens: usize,
    /// Number of tokens emitted during decode.
    pub generated_tokens: usize,
    /// Why generation ended.
    pub stop_reason: StopReason,
}

/// A point-in-time copy of a session's KV cache, restorable into any session
/// built from the same model configuration.
///
/// Carries only cache bytes and position, not sampler or RNG state: a
/// restored session samples with whatever [`SamplingOptions`] the next
/// `generate_streaming` call supplies.
pub struct GenerationSnapshot {
    layers: Vec<(Vec<f32>, Vec<f32>)>,
    pos: usize,
}

impl GenerationSnapshot {
    /// Number of positions captured in this snapshot.
    pub fn len(&self) -> usize {
        self.pos
    }

    /// Whether this snapshot captured zero positions.
    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }
}

/// Drives one conversation's worth of generation against a loaded model.
///
/// Not `Send`-shared across threads: the contract is one outstanding
/// `generate_*` call at a time, per session, from the owning caller.
pub struct GenerationSession {
    model: Arc<LoadedModel>,
    kv_cache: KvCache,
    sampler: Sampler,
    constraint: Option<Box<dyn Constraint>>,
    pos: usize,
    max_context: usize,
    request_timeout: Duration,
    thread_pool: Arc<rayon::ThreadPool>,
}

impl GenerationSession {
    /// Build a session against `model`, sized by `options.max_context_tokens`
    /// (clamped to the model's own declared `max_context`).
    pub fn new(
        model: Arc<LoadedModel>,
        options: &EngineOptions,
        constraint: Option<Box<dyn Constraint>>,
    ) -> Result<Self> {
        model.weights.config.validate()?;
        let cfg = &model.weights.config;
        let max_context = if options.max_context_tokens == 0 {
            cfg.max_context
        } else {
            options.max_context_tokens.min(cfg.max_context)
        };
        let kv_cache = KvCache::new(cfg.num_layers, max_context, cfg.num_kv_heads, cfg.head_dim);
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.resolved_num_threads())
            .build()
            .map_err(|e| EngineError::ValidationError(format!("failed to build worker thread pool: {e}")))?;
        Ok(Self {
            model,
            kv_cache,
            sampler: Sampler::new(&SamplingOptions::default()),
            constraint,
            pos: 0,
            max_context,
            request_timeout: options.request_timeout,
            thread_pool: Arc::new(thread_pool),
        })
    }

    /// Drop all cached K/V and rewind to position zero, keeping the model
    /// and constraint. Call between unrelated prompts on the same session.
    pub fn reset(&mut self) {
        self.kv_cache.reset(None);
        self.pos = 0;
    }

    /// Capture the current KV cache contents and position so generation can
    /// later resume from this point in a fresh or reset session.
    ///
    /// Persists only the raw K/V bytes and the cache position, leaving RNG
    /// state to the caller of each generation call; sampler state is not
    /// captured.
    pub fn snapshot(&self) -> Result<GenerationSnapshot> {
        let num_layers = self.model.weights.layers.len();
        let mut layers = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let view = self.kv_cache.view(layer, self.pos)?;
            layers.push((view.k.to_vec(), view.v.to_vec()));
        }
        Ok(GenerationSnapshot {
            layers,
            pos: self.pos,
        })
    }

    /// Reset this session's KV cache and reload it from a previously captured
    /// snapshot, positioning subsequent decode steps right after it.
    pub fn restore(&mut self, snapshot: &GenerationSnapshot) -> Result<()> {
        self.kv_cache.reset(None);
        for (layer, (k, v)) in snapshot.layers.iter().enumerate() {
            self.kv_cache.append(layer, 0, snapshot.pos, k, v)?;
        }
        self.pos = snapshot.pos;
        Ok(())
    }

    /// Run prefill + decode, invoking `on_token` once per emitted token.
    ///
    /// Prefill appends `prompt`'s tokens starting at the session's current
    /// position rather than always starting over: a fresh session begins at
    /// position zero, but a session that has not been [`reset`](Self::reset)
    /// or just [`restore`](Self::restore)d continues the same cache, which is
    /// how a multi-turn caller keeps prior turns live across calls.
    pub fn generate_streaming(
        &mut self,
        prompt: &str,
        options: &SamplingOptions,
        cancel: &dyn Fn() -> bool,
        mut on_token: impl FnMut(&GeneratedToken),
    ) -> Result<GenerationStats> {
        self.sampler = Sampler::new(options);

        let tokenizer = &self.model.tokenizer;
        let prompt_ids = tokenizer.encode(prompt)?;
        if prompt_ids.is_empty() {
            return Err(EngineError::ValidationError(
                "prompt encoded to zero tokens".into(),
            ));
        }
        if self.pos + prompt_ids.len() > self.max_context {
            return Err(EngineError::ContextOverflow(format!(
                "prompt has {} tokens but only {} of {} context remain",
                prompt_ids.len(),
                self.max_context - self.pos,
                self.max_context
            )));
        }

        let start = Instant::now();
        let effective_cancel = || cancel() || start.elapsed() > self.request_timeout;

        if effective_cancel() {
            return Ok(GenerationStats {
                prompt_tokens: prompt_ids.len(),
                generated_tokens: 0,
                stop_reason: StopReason::Cancelled,
            });
        }

        let prefill_pos = self.pos;
        let model = &self.model;
        let kv_cache = &mut self.kv_cache;
        let prefill = self
            .thread_pool
            .install(|| forward::forward(&model.weights, kv_cache, &prompt_ids, prefill_pos, true))?;
        self.pos = prefill_pos + prompt_ids.len();
        let mut last_logits = prefill.logits.row(0).to_vec();
        debug!("prefill complete at position {}", self.pos);

        let max_stop_len = options.stop_strings.iter().map(|s| s.len()).max().unwrap_or(0);
        let mut generated_text = String::new();
        let mut generated_count = 0usize;
        let mut stop_reason = StopReason::MaxNewTokens;

        for step in 0..options.max_new_tokens {
            if effective_cancel() {
                stop_reason = StopReason::Cancelled;
                break;
            }

            let constraint_step = self
                .constraint
                .as_mut()
                .map(|c| c.step(&generated_text, tokenizer.vocab()));
            let mask = constraint_step.as_ref().map(|s| s.mask.as_slice());

            // `last_logits` is fully consumed by this sample call: the next
            // iteration (if any) overwrites it with the following step's
            // output, so sampling can mutate it in place instead of cloning.
            let token_id = self.sampler.sample(&mut last_logits, options, mask)?;
            self.sampler.record(token_id);

            let token_text = tokenizer.decode(&[token_id])?;
            generated_text.push_str(&token_text);
            generated_count += 1;

            let mut is_final = false;
            if options.stop_token_ids.contains(&token_id) {
                stop_reason = StopReason::StopToken;
                is_final = true;
            } else if max_stop_len > 0
                && stop_string_match(&generated_text, &options.stop_strings, max_stop_len).is_some()
            {
                stop_reason = StopReason::StopString;
                is_final = true;
            } else if constraint_step.as_ref().is_some_and(|s| s.complete) {
                stop_reason = StopReason::ConstraintComplete;
                is_final = true;
            } else if step + 1 == options.max_new_tokens {
                stop_reason = StopReason::MaxNewTokens;
                is_final = true;
            }

            on_token(&GeneratedToken {
                token_id,
                token_text,
                is_final,
                stop_reason: is_final.then_some(stop_reason),
            });

            if is_final {
                break;
            }

            let model = &self.model;
            let kv_cache = &mut self.kv_cache;
            let pos = self.pos;
            let step_out = self
                .thread_pool
                .install(|| forward::forward(&model.weights, kv_cache, &[token_id], pos, true))?;
            self.pos += 1;
            last_logits = step_out.logits.row(0).to_vec();
        }

        Ok(GenerationStats {
            prompt_tokens: prompt_ids.len(),
            generated_tokens: generated_count,
            stop_reason,
        })
    }

    /// Thin wrapper over [`Self::generate_streaming`] collecting the full
    /// emitted string instead of streaming per-token callbacks.
    pub fn generate(
        &mut self,
        prompt: &str,
        options: &SamplingOptions,
        cancel: &dyn Fn() -> bool,
    ) -> Result<(String, GenerationStats)> {
        let mut text = String::new();
        let stats = self.generate_streaming(prompt, options, cancel, |tok| {
            text.push_str(&tok.token_text);
        })?;
        Ok((text, stats))
    }
}

/// Search only the trailing `window` bytes of `text` (clamped to a char
/// boundary) for any of `stop_strings`, avoiding a full rescan every step.
fn stop_string_match<'a>(text: &str, stop_strings: &'a [String], window: usize) -> Option<&'a str> {
    let mut start = text.len().saturating_sub(window);
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    let tail = &text[start..];
    stop_strings.iter().find(|s| tail.contains(s.as_str())).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_string_found_within_window() {
        let stops = vec!["\n\n".to_string()];
        assert_eq!(stop_string_match("foo\n\n", &stops, 2), Some("\n\n"));
    }

    #[test]
    fn stop_string_absent_outside_window_is_not_matched() {
        let stops = vec!["foo".to_string()];
        // window smaller than the distance back to "foo"
        assert_eq!(stop_string_match("foobar", &stops, 2), None);
    }

    #[test]
    fn window_clamps_to_char_boundary() {
        let stops = vec!["\u{1F600}".to_string()];
        let text = format!("hi {}", '\u{1F600}');
        assert!(stop_string_match(&text, &stops, 1).is_none() || stop_string_match(&text, &stops, 5).is_some());
    }
}
