//! Generation controller: token ids in, token ids out.
//!
//! [`Generator`] drives a loaded [`ModelHandle`] through one prefill step over
//! the whole prompt and then single-token decode steps, each feeding back the
//! most recent token and relying on the engine's KV cache for the history.
//! Every call starts from a reset cache.

use std::sync::Mutex;

use tracing::{debug, info};

use crate::backend::NativeEngine;
use crate::error::InferenceError;
use crate::model::handle::ModelHandle;

use super::sampler::SamplingConfig;

/// Default number of tokens to generate.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 128;

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Produced the end token (or an extra stop token).
    EndToken,
    /// Reached `max_new_tokens`.
    MaxTokens,
    /// Filled the model's context window.
    ContextLength,
    /// Streaming callback returned `false`.
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::EndToken => write!(f, "eos"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::ContextLength => write!(f, "context_length"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Output from one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    /// Prompt followed by every generated token.
    pub tokens: Vec<i64>,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Number of prompt tokens at the front of `tokens`.
    pub prompt_tokens: usize,
}

impl GenerationOutput {
    /// The generated suffix, including the end token if one was produced.
    pub fn generated(&self) -> &[i64] {
        &self.tokens[self.prompt_tokens..]
    }
}

/// Configuration for one generation call.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Upper bound on generated tokens. 0 behaves like 1: the prefill token
    /// is always produced.
    pub max_new_tokens: usize,
    /// Sampling parameters passed through to the engine.
    pub sampling: SamplingConfig,
    /// Stop tokens in addition to the model's end token.
    pub stop_tokens: Vec<i64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            sampling: SamplingConfig::default(),
            stop_tokens: Vec::new(),
        }
    }
}

/// Generation controller over one model handle.
///
/// Not shareable between concurrent requests: wrap it in a
/// [`SharedGenerator`] or give each request its own handle.
pub struct Generator<E: NativeEngine> {
    handle: ModelHandle<E>,
}

impl<E: NativeEngine> Generator<E> {
    /// Wrap a handle whose weights are loaded.
    pub fn new(handle: ModelHandle<E>) -> Result<Self, InferenceError> {
        if !handle.is_ready() {
            return Err(InferenceError::WeightValidation(
                "generator requires a model with loaded weights".to_string(),
            ));
        }
        Ok(Self { handle })
    }

    pub fn handle(&self) -> &ModelHandle<E> {
        &self.handle
    }

    /// Generate and return the prompt followed by the generated tokens.
    pub fn generate(
        &mut self,
        inputs: &[i64],
        config: &GenerationConfig,
    ) -> Result<Vec<i64>, InferenceError> {
        Ok(self.generate_stream(inputs, config, |_| true)?.tokens)
    }

    /// Generate with full metadata (stop reason, prompt token count).
    pub fn generate_full(
        &mut self,
        inputs: &[i64],
        config: &GenerationConfig,
    ) -> Result<GenerationOutput, InferenceError> {
        self.generate_stream(inputs, config, |_| true)
    }

    /// Generate, invoking `callback` with each token as it is produced.
    ///
    /// Returning `false` from the callback stops generation after that token.
    /// The end token (and any extra stop token) ends generation wherever it
    /// appears, including as the prefill result, so no decode step ever
    /// follows it. An engine failure aborts the call; the handle stays usable because the
    /// next call resets the cache.
    pub fn generate_stream(
        &mut self,
        inputs: &[i64],
        config: &GenerationConfig,
        mut callback: impl FnMut(i64) -> bool,
    ) -> Result<GenerationOutput, InferenceError> {
        if inputs.is_empty() {
            return Err(InferenceError::InvalidArgument(
                "input token sequence is empty".to_string(),
            ));
        }
        let max_seq_len = self.handle.meta().max_seq_len;
        if inputs.len() >= max_seq_len {
            return Err(InferenceError::InvalidArgument(format!(
                "prompt length ({}) must be below max_seq_len ({})",
                inputs.len(),
                max_seq_len
            )));
        }
        config.sampling.validate()?;

        let end_token = self.handle.meta().end_token;
        let is_stop = |t: i64| t == end_token || config.stop_tokens.contains(&t);
        let budget = config.max_new_tokens.max(1);

        info!(
            prompt_tokens = inputs.len(),
            max_new_tokens = budget,
            end_token,
            "Starting generation"
        );

        self.handle.reset();

        let mut tokens = Vec::with_capacity(inputs.len() + budget);
        tokens.extend_from_slice(inputs);

        // Prefill
        let mut next = self.handle.infer(inputs, &config.sampling)?;
        let mut cached = inputs.len();
        let mut generated = 0usize;

        let stop_reason = loop {
            tokens.push(next);
            generated += 1;
            debug!(step = generated, token = next, "Generated token");

            let keep_going = callback(next);
            if is_stop(next) {
                break StopReason::EndToken;
            }
            if !keep_going {
                break StopReason::Cancelled;
            }
            if generated >= budget {
                break StopReason::MaxTokens;
            }
            if cached >= max_seq_len {
                break StopReason::ContextLength;
            }

            // Decode
            next = self.handle.infer(&[next], &config.sampling)?;
            cached += 1;
        };

        info!(
            generated,
            stop_reason = %stop_reason,
            "Generation finished"
        );

        Ok(GenerationOutput {
            tokens,
            stop_reason,
            prompt_tokens: inputs.len(),
        })
    }
}

/// A [`Generator`] behind a mutex, serializing whole generation calls.
pub struct SharedGenerator<E: NativeEngine> {
    inner: Mutex<Generator<E>>,
}

impl<E: NativeEngine> SharedGenerator<E> {
    pub fn new(generator: Generator<E>) -> Self {
        Self {
            inner: Mutex::new(generator),
        }
    }

    pub fn generate(
        &self,
        inputs: &[i64],
        config: &GenerationConfig,
    ) -> Result<GenerationOutput, InferenceError> {
        let mut generator = self
            .inner
            .lock()
            .map_err(|_| InferenceError::Backend("generator mutex poisoned".to_string()))?;
        generator.generate_full(inputs, config)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::scripted::{Call, ScriptedEngine};
    use crate::backend::DeviceType;
    use crate::model::handle::tests::tiny_meta;
    use crate::model::weights::Slot;

    // tiny_meta: vocab 32, end token 31, max_seq_len 16.
    fn generator(engine: &Arc<ScriptedEngine>) -> Generator<ScriptedEngine> {
        let mut handle =
            ModelHandle::create(engine.clone(), tiny_meta(), DeviceType::Cpu, &[0]).unwrap();
        for slot in Slot::all(2) {
            handle.load_slot(slot, &[0u8; 4]).unwrap();
        }
        handle.finish_loading(true).unwrap();
        Generator::new(handle).unwrap()
    }

    fn config(max_new_tokens: usize) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = GenerationConfig::default();
        assert_eq!(config.max_new_tokens, 128);
        assert_eq!(config.sampling, SamplingConfig::default());
    }

    #[test]
    fn test_single_token_is_prefill_only() {
        let engine = Arc::new(ScriptedEngine::new().with_replies([4]));
        let mut g = generator(&engine);

        let out = g.generate(&[5, 7, 9], &config(1)).unwrap();
        assert_eq!(out, vec![5, 7, 9, 4]);
        assert_eq!(engine.infer_calls(), vec![vec![5, 7, 9]]);
    }

    #[test]
    fn test_zero_max_tokens_still_prefills() {
        let engine = Arc::new(ScriptedEngine::new().with_replies([4, 5]));
        let mut g = generator(&engine);
        let out = g.generate_full(&[1], &config(0)).unwrap();
        assert_eq!(out.tokens, vec![1, 4]);
        assert_eq!(out.stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn test_reset_before_prefill_then_decode_feeds_last_token() {
        let engine = Arc::new(ScriptedEngine::new().with_replies([4, 6, 8]));
        let mut g = generator(&engine);

        let out = g.generate_full(&[5, 7, 9], &config(3)).unwrap();
        assert_eq!(out.tokens, vec![5, 7, 9, 4, 6, 8]);
        assert_eq!(out.generated(), &[4, 6, 8]);
        assert_eq!(out.stop_reason, StopReason::MaxTokens);

        let calls = engine.calls();
        let first_reset = calls.iter().position(|c| *c == Call::Reset).unwrap();
        let first_infer = calls.iter().position(|c| matches!(c, Call::Infer(_))).unwrap();
        assert!(first_reset < first_infer);
        assert_eq!(engine.infer_calls(), vec![vec![5, 7, 9], vec![4], vec![6]]);
    }

    #[test]
    fn test_prefill_failure_appends_nothing() {
        let engine = Arc::new(ScriptedEngine::new().with_replies([-1]));
        let mut g = generator(&engine);
        let err = g.generate(&[5, 7, 9], &config(4)).unwrap_err();
        assert!(matches!(err, InferenceError::Inference(_)));
        assert_eq!(engine.infer_calls().len(), 1);
    }

    #[test]
    fn test_stops_after_end_token() {
        let engine = Arc::new(ScriptedEngine::new().with_replies([4, 6, 31, 8]));
        let mut g = generator(&engine);
        let out = g.generate_full(&[1, 2], &config(10)).unwrap();
        assert_eq!(out.tokens, vec![1, 2, 4, 6, 31]);
        assert_eq!(out.stop_reason, StopReason::EndToken);
        assert_eq!(engine.infer_calls().len(), 3);
    }

    #[test]
    fn test_end_token_from_prefill_stops() {
        let engine = Arc::new(ScriptedEngine::new().with_replies([31, 8]));
        let mut g = generator(&engine);
        let out = g.generate_full(&[1], &config(10)).unwrap();
        assert_eq!(out.tokens, vec![1, 31]);
        assert_eq!(engine.infer_calls().len(), 1);
    }

    #[test]
    fn test_extra_stop_tokens() {
        let engine = Arc::new(ScriptedEngine::new().with_replies([4, 6, 8]));
        let mut g = generator(&engine);
        let cfg = GenerationConfig {
            stop_tokens: vec![6],
            ..config(10)
        };
        let out = g.generate_full(&[1], &cfg).unwrap();
        assert_eq!(out.generated(), &[4, 6]);
        assert_eq!(out.stop_reason, StopReason::EndToken);
    }

    #[test]
    fn test_max_tokens_bounds_iterations() {
        let engine = Arc::new(ScriptedEngine::new().with_fallback(3));
        let mut g = generator(&engine);
        let out = g.generate_full(&[1], &config(5)).unwrap();
        assert_eq!(out.generated().len(), 5);
        assert_eq!(engine.infer_calls().len(), 5);
    }

    #[test]
    fn test_context_length_stop() {
        let engine = Arc::new(ScriptedEngine::new().with_fallback(3));
        let mut g = generator(&engine);
        let prompt: Vec<i64> = (0..14).collect();
        let out = g.generate_full(&prompt, &config(10)).unwrap();
        // 14 cached after prefill, two decode steps fill positions 14 and 15.
        assert_eq!(out.generated().len(), 3);
        assert_eq!(out.stop_reason, StopReason::ContextLength);
    }

    #[test]
    fn test_invalid_inputs_rejected_before_engine() {
        let engine = Arc::new(ScriptedEngine::new());
        let mut g = generator(&engine);

        let err = g.generate(&[], &config(4)).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidArgument(_)));

        let long: Vec<i64> = (0..16).collect();
        let err = g.generate(&long, &config(4)).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidArgument(_)));

        assert!(engine.infer_calls().is_empty());
        assert!(!engine.calls().contains(&Call::Reset));
    }

    #[test]
    fn test_callback_cancels() {
        let engine = Arc::new(ScriptedEngine::new().with_fallback(3));
        let mut g = generator(&engine);
        let mut seen = Vec::new();
        let out = g
            .generate_stream(&[1], &config(10), |t| {
                seen.push(t);
                seen.len() < 2
            })
            .unwrap();
        assert_eq!(seen, vec![3, 3]);
        assert_eq!(out.generated().len(), 2);
        assert_eq!(out.stop_reason, StopReason::Cancelled);
    }

    #[test]
    fn test_recovers_after_decode_failure() {
        let engine = Arc::new(ScriptedEngine::new().with_replies([4, -1, 7]));
        let mut g = generator(&engine);
        assert!(g.generate(&[1], &config(5)).is_err());

        let out = g.generate(&[2], &config(1)).unwrap();
        assert_eq!(out, vec![2, 7]);
        let resets = engine.calls().iter().filter(|c| **c == Call::Reset).count();
        assert_eq!(resets, 2);
    }

    #[test]
    fn test_generator_requires_loaded_handle() {
        let engine = Arc::new(ScriptedEngine::new());
        let handle = ModelHandle::create(engine, tiny_meta(), DeviceType::Cpu, &[0]).unwrap();
        assert!(matches!(
            Generator::new(handle),
            Err(InferenceError::WeightValidation(_))
        ));
    }

    #[test]
    fn test_shared_generator_serializes_calls() {
        let engine = Arc::new(ScriptedEngine::new().with_fallback(3));
        let shared = Arc::new(SharedGenerator::new(generator(&engine)));

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || shared.generate(&[i], &config(3)).unwrap())
            })
            .collect();
        for w in workers {
            assert_eq!(w.join().unwrap().generated(), &[3, 3, 3]);
        }

        // Every request ran reset, prefill, two decodes without interleaving.
        let calls = engine.calls();
        let requests: Vec<&[Call]> = calls.split(|c| *c == Call::Reset).skip(1).collect();
        assert_eq!(requests.len(), 4);
        for r in requests {
            assert_eq!(r.len(), 3);
        }
    }
}
