//! Token sampling: penalties, constraint masking, temperature, top-k,
//! top-p, min-p, then a seeded multinomial draw, applied in that fixed
//! order on every decode step.

use std::collections::VecDeque;

use rand::distributions::{Distribution, WeightedIndex};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::SamplingOptions;
use crate::error::{EngineError, Result};

/// Rolling window of recently generated token ids, used by the penalty terms.
pub struct PenaltyWindow {
    window: VecDeque<u32>,
    capacity: usize,
}

impl PenaltyWindow {
    /// A window retaining the most recent `capacity` token ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity.max(1)),
            capacity,
        }
    }

    /// Record a newly emitted token id, evicting the oldest if over capacity.
    pub fn push(&mut self, id: u32) {
        if self.capacity == 0 {
            return;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(id);
    }

    /// Count of `id` within the current window.
    pub fn count(&self, id: u32) -> usize {
        self.window.iter().filter(|&&x| x == id).count()
    }

    /// Distinct token ids currently in the window.
    pub fn distinct(&self) -> impl Iterator<Item = u32> + '_ {
        self.window.iter().copied().collect::<std::collections::HashSet<_>>().into_iter()
    }
}

/// Per-session sampling state: RNG and penalty history. Constructed once per
/// session and reused across decode steps.
pub struct Sampler {
    rng: ChaCha8Rng,
    window: PenaltyWindow,
}

impl Sampler {
    /// Build a sampler seeded by `options.seed`, or process entropy if unset.
    pub fn new(options: &SamplingOptions) -> Self {
        let rng = match options.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            rng,
            window: PenaltyWindow::new(options.penalty_window),
        }
    }

    /// Record a token as emitted, for future penalty calculations.
    pub fn record(&mut self, id: u32) {
        self.window.push(id);
    }

    /// Run the full sampling pipeline over `logits` (length `vocab_size`),
    /// returning the sampled token id. `mask` disables tokens when it
    /// provides a constraint (see [`crate::constraints`]); `None` entries are
    /// left untouched.
    pub fn sample(&mut self, logits: &mut [f32], options: &SamplingOptions, mask: Option<&[bool]>) -> Result<u32> {
        self.apply_penalties(logits, options);

        if let Some(mask) = mask {
            for (logit, &allowed) in logits.iter_mut().zip(mask.iter()) {
                if !allowed {
                    *logit = f32::NEG_INFINITY;
                }
            }
        }

        if options.temperature <= 0.0 {
            return argmax(logits);
        }
        for v in logits.iter_mut() {
            *v /= options.temperature;
        }

        softmax_probs(logits);
        top_k_filter(logits, options.top_k);
        top_p_filter(logits, options.top_p);
        min_p_filter(logits, options.min_p);
        renormalize(logits);

        self.draw(logits)
    }

    fn apply_penalties(&self, logits: &mut [f32], options: &SamplingOptions) {
        let neutral = options.repetition_penalty == 1.0
            && options.presence_penalty == 0.0
            && options.frequency_penalty == 0.0;
        if neutral {
            return;
        }
        for id in self.window.distinct() {
            let idx = id as usize;
            if idx >= logits.len() {
                continue;
            }
            let c = self.window.count(id);
            if options.repetition_penalty != 1.0 {
                let l = logits[idx];
                logits[idx] = if l > 0.0 {
                    l / options.repetition_penalty
                } else {
                    l * options.repetition_penalty
                };
            }
            if options.presence_penalty != 0.0 && c >= 1 {
                logits[idx] -= options.presence_penalty;
            }
            if options.frequency_penalty != 0.0 {
                logits[idx] -= options.frequency_penalty * c as f32;
            }
        }
    }

    fn draw(&mut self, probs: &[f32]) -> Result<u32> {
        let weights: Vec<f32> = probs.iter().map(|&p| p.max(0.0)).collect();
        if weights.iter().all(|&w| w == 0.0) {
            return argmax(probs);
        }
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| EngineError::InternalKernelError(format!("sampling distribution invalid: {e}")))?;
        Ok(dist.sample(&mut self.rng) as u32)
    }
}

fn argmax(values: &[f32]) -> Result<u32> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .map(|(i, _)| i as u32)
        .ok_or_else(|| EngineError::InternalKernelError("no finite logit to select".into()))
}

fn softmax_probs(logits: &mut [f32]) {
    smallmind_kernels::primitives::softmax(logits);
}

fn top_k_filter(probs: &mut [f32], k: usize) {
    if k == 0 || k >= probs.len() {
        return;
    }
    let mut sorted: Vec<f32> = probs.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
    let threshold = sorted[k - 1];
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

fn top_p_filter(probs: &mut [f32], p: f32) {
    if p >= 1.0 {
        return;
    }
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    let mut cumulative = 0.0;
    let mut cutoff = indexed.len();
    for (i, (_, prob)) in indexed.iter().enumerate() {
        cumulative += prob;
        if cumulative >= p {
            cutoff = i + 1;
            break;
        }
    }
    for &(idx, _) in &indexed[cutoff..] {
        probs[idx] = 0.0;
    }
}

fn min_p_filter(probs: &mut [f32], min_p: f32) {
    if min_p <= 0.0 {
        return;
    }
    let p_max = probs.iter().copied().fold(0.0f32, f32::max);
    let threshold = min_p * p_max;
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

fn renormalize(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(temperature: f32, seed: Option<u64>) -> SamplingOptions {
        SamplingOptions {
            temperature,
            seed,
            ..SamplingOptions::default()
        }
    }

    #[test]
    fn greedy_is_deterministic_argmax() {
        let mut logits = vec![0.1, 0.9, 0.2, -0.5];
        let mut sampler = Sampler::new(&opts(0.0, None));
        let id = sampler.sample(&mut logits, &opts(0.0, None), None).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let options = SamplingOptions {
            temperature: 0.7,
            top_p: 0.9,
            seed: Some(42),
            ..SamplingOptions::default()
        };
        let base_logits = vec![1.0, 2.0, 0.5, 3.0, 0.1];

        let mut sampler_a = Sampler::new(&options);
        let mut logits_a = base_logits.clone();
        let id_a = sampler_a.sample(&mut logits_a, &options, None).unwrap();

        let mut sampler_b = Sampler::new(&options);
        let mut logits_b = base_logits.clone();
        let id_b = sampler_b.sample(&mut logits_b, &options, None).unwrap();

        assert_eq!(id_a, id_b);
    }

    #[test]
    fn top_k_zeroes_below_threshold() {
        let mut probs = vec![0.4, 0.3, 0.2, 0.1];
        top_k_filter(&mut probs, 2);
        assert_eq!(probs, vec![0.4, 0.3, 0.0, 0.0]);
    }

    #[test]
    fn constraint_mask_forces_allowed_token() {
        let mut logits = vec![5.0, 1.0, 1.0];
        let mask = vec![false, true, false];
        let mut sampler = Sampler::new(&opts(0.0, None));
        let id = sampler.sample(&mut logits, &opts(0.0, None), Some(&mask)).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn penalty_window_tracks_recent_counts() {
        let mut w = PenaltyWindow::new(3);
        w.push(1);
        w.push(1);
        w.push(2);
        assert_eq!(w.count(1), 2);
        w.push(3); // evicts the first 1
        assert_eq!(w.count(1), 1);
    }
}
