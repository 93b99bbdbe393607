// Token sampling over a logits row.
//
// Greedy (argmax) plus temperature, top-k and top-p (nucleus) filtering,
// driven by a seeded XorShift RNG so runs are reproducible.

use crate::error::InferenceError;

/// Sampling parameters carried with every inference request.
///
/// The defaults (top-k 1) select the argmax token.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    /// Logit temperature. 0.0 = greedy (argmax).
    pub temperature: f32,
    /// Keep only the k most likely tokens. 0 = disabled, 1 = greedy.
    pub top_k: usize,
    /// Nucleus cutoff on cumulative probability. 1.0 = disabled.
    pub top_p: f32,
    /// RNG seed; `None` seeds from the clock.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 1,
            top_p: 0.8,
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Plain argmax decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 1,
            top_p: 1.0,
            seed: None,
        }
    }

    /// Whether these parameters always pick the most likely token.
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0 || self.top_k == 1
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(InferenceError::InvalidArgument(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(InferenceError::InvalidArgument(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }

    /// Seed for a fresh RNG: the configured one, or the clock.
    pub fn effective_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9E37_79B9_7F4A_7C15)
        })
    }
}

/// XorShift64 RNG.
#[derive(Debug, Clone)]
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    /// Create a new RNG from a seed. Seed of 0 is adjusted to 1.
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform f32 in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Index of the maximum value; the first one wins ties.
pub fn argmax(logits: &[f32]) -> usize {
    let mut best_idx = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = i;
        }
    }
    best_idx
}

/// Pick a token index from one logits row.
///
/// 1. Greedy parameters return the argmax.
/// 2. Logits are divided by the temperature.
/// 3. Top-k keeps the k highest logits.
/// 4. Softmax over the survivors.
/// 5. Top-p keeps the smallest prefix reaching the cumulative cutoff.
/// 6. Draw from the renormalized distribution.
pub fn sample_token(logits: &[f32], config: &SamplingConfig, rng: &mut XorShiftRng) -> usize {
    if logits.is_empty() {
        return 0;
    }
    if config.is_greedy() {
        return argmax(logits);
    }

    let mut candidates: Vec<(usize, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &l)| (i, l / config.temperature))
        .collect();
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    if config.top_k > 0 && config.top_k < candidates.len() {
        candidates.truncate(config.top_k);
    }

    let max_logit = candidates[0].1;
    let mut probs: Vec<(usize, f32)> = candidates
        .iter()
        .map(|&(idx, logit)| (idx, (logit - max_logit).exp()))
        .collect();
    let sum: f32 = probs.iter().map(|c| c.1).sum();
    for c in &mut probs {
        c.1 /= sum;
    }

    // Candidates are already sorted by probability.
    if config.top_p < 1.0 {
        let mut cumulative = 0.0f32;
        let mut cutoff = probs.len();
        for (i, &(_, p)) in probs.iter().enumerate() {
            cumulative += p;
            if cumulative >= config.top_p {
                cutoff = i + 1;
                break;
            }
        }
        probs.truncate(cutoff);
        let kept: f32 = probs.iter().map(|c| c.1).sum();
        for c in &mut probs {
            c.1 /= kept;
        }
    }

    let r = rng.next_f32();
    let mut cumulative = 0.0f32;
    for &(idx, p) in &probs {
        cumulative += p;
        if r < cumulative {
            return idx;
        }
    }
    probs.last().map(|c| c.0).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stochastic(top_k: usize, top_p: f32) -> SamplingConfig {
        SamplingConfig {
            temperature: 1.0,
            top_k,
            top_p,
            seed: Some(42),
        }
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[1.0, 3.0, 2.0]), 1);
        assert_eq!(argmax(&[-3.0, -1.0, -2.0]), 1);
        assert_eq!(argmax(&[42.0]), 0);
        assert_eq!(argmax(&[2.0, 2.0]), 0);
    }

    #[test]
    fn test_defaults_are_greedy() {
        let config = SamplingConfig::default();
        assert_eq!(config.top_k, 1);
        assert_eq!(config.top_p, 0.8);
        assert_eq!(config.temperature, 0.8);
        assert!(config.is_greedy());

        let mut rng = XorShiftRng::new(7);
        for _ in 0..20 {
            assert_eq!(sample_token(&[1.0, 5.0, 4.9, 3.0], &config, &mut rng), 1);
        }
    }

    #[test]
    fn test_zero_temperature_ignores_rng() {
        let logits = [1.0, 5.0, 2.0, 3.0];
        let config = SamplingConfig {
            temperature: 0.0,
            top_k: 0,
            ..Default::default()
        };
        let mut rng1 = XorShiftRng::new(42);
        let mut rng2 = XorShiftRng::new(99);
        assert_eq!(sample_token(&logits, &config, &mut rng1), 1);
        assert_eq!(sample_token(&logits, &config, &mut rng2), 1);
    }

    #[test]
    fn test_same_seed_same_token() {
        let logits = [1.0, 5.0, 2.0, 3.0];
        let config = stochastic(0, 1.0);
        let mut rng1 = XorShiftRng::new(42);
        let mut rng2 = XorShiftRng::new(42);
        for _ in 0..10 {
            assert_eq!(
                sample_token(&logits, &config, &mut rng1),
                sample_token(&logits, &config, &mut rng2)
            );
        }
    }

    #[test]
    fn test_top_k_limits_candidates() {
        let logits = [1.0, 10.0, 9.5, 0.0];
        let config = stochastic(2, 1.0);
        let mut rng = XorShiftRng::new(3);
        for _ in 0..50 {
            let t = sample_token(&logits, &config, &mut rng);
            assert!(t == 1 || t == 2, "picked {}", t);
        }
    }

    #[test]
    fn test_top_p_limits_candidates() {
        let logits = [0.0, 100.0, 0.0, 0.0];
        let config = stochastic(0, 0.01);
        let mut rng = XorShiftRng::new(42);
        assert_eq!(sample_token(&logits, &config, &mut rng), 1);
    }

    #[test]
    fn test_low_temperature_is_peaked() {
        let logits = [1.0, 2.0, 3.0, 4.0];
        let config = SamplingConfig {
            temperature: 0.01,
            top_k: 0,
            top_p: 1.0,
            seed: Some(42),
        };
        let mut rng = XorShiftRng::new(42);
        let hits = (0..100)
            .filter(|_| sample_token(&logits, &config, &mut rng) == 3)
            .count();
        assert!(hits > 90, "low temperature picked the top token {}/100 times", hits);
    }

    #[test]
    fn test_uniform_logits_stay_in_range() {
        let logits = vec![1.0; 100];
        let config = stochastic(0, 1.0);
        let mut rng = XorShiftRng::new(42);
        for _ in 0..100 {
            assert!(sample_token(&logits, &config, &mut rng) < 100);
        }
    }

    #[test]
    fn test_empty_logits() {
        let mut rng = XorShiftRng::new(42);
        assert_eq!(sample_token(&[], &stochastic(0, 1.0), &mut rng), 0);
    }

    #[test]
    fn test_validate() {
        assert!(SamplingConfig::default().validate().is_ok());
        let bad_temp = SamplingConfig {
            temperature: -1.0,
            ..Default::default()
        };
        assert!(bad_temp.validate().is_err());
        let bad_p = SamplingConfig {
            top_p: 0.0,
            ..Default::default()
        };
        assert!(bad_p.validate().is_err());
    }

    #[test]
    fn test_xorshift_f32_range() {
        let mut rng = XorShiftRng::new(0);
        for _ in 0..1000 {
            let v = rng.next_f32();
            assert!((0.0..1.0).contains(&v), "next_f32 out of range: {}", v);
        }
    }
}
