//! Token sampling and per-sequence decoding state.
//!
//! [`LogitSampler`] implements greedy (argmax) and multinomial decoding with
//! temperature, top-k and top-p filtering over the last logits row of each
//! running [`SequenceState`]. Randomness comes from a seeded XorShift RNG so runs
//! are reproducible.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::trace;

use crate::error::InferenceError;
use crate::tensor::Tensor;

/// Token id as fed to the model.
pub type TokenId = i64;

/// Multinomial sampling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    /// Logit divisor. 0.0 = greedy.
    pub temperature: f32,
    /// Keep only the top-k logits. 0 = disabled.
    pub top_k: usize,
    /// Nucleus cutoff. 1.0 = disabled.
    pub top_p: f32,
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingStrategy {
    Greedy,
    Multinomial,
    BeamSearch,
}

/// Per-call generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// `None` generates until EOS, a stop token, or the cache is full.
    pub max_new_tokens: Option<usize>,
    pub eos_token_id: Option<TokenId>,
    pub stop_token_ids: BTreeSet<TokenId>,
    /// Keep generating through EOS.
    pub ignore_eos: bool,
    pub do_sample: bool,
    pub num_beams: usize,
    pub num_return_sequences: usize,
    pub sampling: SamplingConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: None,
            eos_token_id: None,
            stop_token_ids: BTreeSet::new(),
            ignore_eos: false,
            do_sample: false,
            num_beams: 1,
            num_return_sequences: 1,
            sampling: SamplingConfig::default(),
        }
    }
}

impl GenerationConfig {
    pub fn greedy() -> Self {
        Self::default()
    }

    pub fn multinomial(sampling: SamplingConfig) -> Self {
        Self {
            do_sample: true,
            sampling,
            ..Self::default()
        }
    }

    pub fn strategy(&self) -> DecodingStrategy {
        if self.num_beams > 1 {
            DecodingStrategy::BeamSearch
        } else if self.do_sample {
            DecodingStrategy::Multinomial
        } else {
            DecodingStrategy::Greedy
        }
    }

    pub fn is_greedy_decoding(&self) -> bool {
        self.strategy() == DecodingStrategy::Greedy
    }

    pub fn is_multinomial(&self) -> bool {
        self.strategy() == DecodingStrategy::Multinomial
    }

    /// Fill unset stop criteria from `defaults`.
    pub fn with_defaults_from(mut self, defaults: &GenerationConfig) -> Self {
        if self.stop_token_ids.is_empty() {
            self.stop_token_ids = defaults.stop_token_ids.clone();
        }
        if self.eos_token_id.is_none() {
            self.eos_token_id = defaults.eos_token_id;
        }
        self
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.max_new_tokens == Some(0) {
            return Err(InferenceError::Config(
                "max_new_tokens must be greater than 0".to_string(),
            ));
        }
        if self.num_beams == 0 || self.num_return_sequences == 0 {
            return Err(InferenceError::Config(
                "num_beams and num_return_sequences must be at least 1".to_string(),
            ));
        }
        if self.is_multinomial() {
            let s = &self.sampling;
            if s.temperature.is_nan() || s.temperature <= 0.0 {
                return Err(InferenceError::Config(format!(
                    "multinomial decoding needs temperature > 0, got {}",
                    s.temperature
                )));
            }
            if s.top_p.is_nan() || s.top_p <= 0.0 || s.top_p > 1.0 {
                return Err(InferenceError::Config(format!(
                    "top_p must be in (0, 1], got {}",
                    s.top_p
                )));
            }
        }
        if self.ignore_eos && self.max_new_tokens.is_none() && self.stop_token_ids.is_empty() {
            return Err(InferenceError::Config(
                "ignore_eos needs max_new_tokens or stop_token_ids to terminate".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why a sequence stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FinishReason {
    Eos,
    StopToken,
    MaxNewTokens,
    /// Streamer asked to stop after the current token.
    Stopped,
    /// Streamer cancelled; the in-flight token was dropped.
    Cancelled,
    /// No KV cache position left for another token.
    OutOfMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Running,
    Finished(FinishReason),
}

/// One sequence being decoded.
#[derive(Debug, Clone)]
pub struct SequenceState {
    prompt_ids: Vec<TokenId>,
    generated_ids: Vec<TokenId>,
    cumulative_log_prob: f32,
    /// Log-probability of each generated token, parallel to `generated_ids`.
    token_log_probs: Vec<f32>,
    status: SequenceStatus,
    /// Cache slots taken once the last generated token has been fed.
    position: usize,
}

impl SequenceState {
    /// State right after the prompt has been prefilled.
    pub fn new(prompt_ids: Vec<TokenId>) -> Self {
        let position = prompt_ids.len();
        Self {
            prompt_ids,
            generated_ids: Vec::new(),
            cumulative_log_prob: 0.0,
            token_log_probs: Vec::new(),
            status: SequenceStatus::Running,
            position,
        }
    }

    pub fn prompt_ids(&self) -> &[TokenId] {
        &self.prompt_ids
    }

    pub fn generated_ids(&self) -> &[TokenId] {
        &self.generated_ids
    }

    pub fn last_token(&self) -> Option<TokenId> {
        self.generated_ids.last().copied()
    }

    pub fn cumulative_log_prob(&self) -> f32 {
        self.cumulative_log_prob
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == SequenceStatus::Running
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Position id the last generated token is fed at, if there is one.
    pub fn next_input_position(&self) -> Option<usize> {
        if self.generated_ids.is_empty() {
            None
        } else {
            Some(self.position - 1)
        }
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self.status {
            SequenceStatus::Running => None,
            SequenceStatus::Finished(reason) => Some(reason),
        }
    }

    /// Append a sampled token; it will occupy the next cache slot.
    pub fn append(&mut self, token: TokenId, log_prob: f32) {
        self.generated_ids.push(token);
        self.token_log_probs.push(log_prob);
        self.cumulative_log_prob += log_prob;
        self.position += 1;
    }

    /// Account for a sampled token that is not part of the output (EOS, stop ids).
    pub fn add_log_prob(&mut self, log_prob: f32) {
        self.cumulative_log_prob += log_prob;
    }

    /// Drop the most recent token and its log-probability, e.g. after a cancel.
    pub fn discard_last(&mut self) -> Option<TokenId> {
        let token = self.generated_ids.pop()?;
        if let Some(lp) = self.token_log_probs.pop() {
            self.cumulative_log_prob -= lp;
        }
        self.position -= 1;
        Some(token)
    }

    /// Mark the sequence finished. A finished sequence keeps its first reason.
    pub fn finish(&mut self, reason: FinishReason) {
        if self.is_running() {
            self.status = SequenceStatus::Finished(reason);
        }
    }

    /// Force the finish reason, replacing any earlier one.
    pub fn set_finished(&mut self, reason: FinishReason) {
        self.status = SequenceStatus::Finished(reason);
    }
}

/// Chooses the next token of each running sequence from a logits tensor.
pub trait Sampler: Send {
    /// `logits` is `[batch, seq, vocab]`; sequence `i` samples from the last row
    /// of batch `i`. Returns the chosen token per running sequence and updates
    /// their finish state.
    fn sample(
        &mut self,
        sequences: &mut [SequenceState],
        logits: &Tensor,
        config: &GenerationConfig,
    ) -> Result<Vec<TokenId>, InferenceError>;
}

/// Simple XorShift64 RNG.
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

/// Index of the largest logit; ties keep the first.
pub fn argmax(logits: &[f32]) -> usize {
    let mut best_idx = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = i;
        }
    }
    best_idx
}

/// `log_softmax(logits)[index]`.
pub fn log_prob(logits: &[f32], index: usize) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|&l| (l - max).exp()).sum();
    logits[index] - max - sum.ln()
}

/// Pick a token index from one logits row.
///
/// Temperature 0 is argmax. Otherwise: scale by temperature, keep top-k, softmax,
/// keep the top-p nucleus, renormalize, and draw.
pub fn sample_token(logits: &[f32], config: &SamplingConfig, rng: &mut XorShiftRng) -> usize {
    if logits.is_empty() {
        return 0;
    }
    if config.temperature <= 0.0 {
        return argmax(logits);
    }

    let mut candidates: Vec<(usize, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &l)| (i, l / config.temperature))
        .collect();

    if config.top_k > 0 && config.top_k < candidates.len() {
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(config.top_k);
    }

    let max_logit = candidates.iter().map(|c| c.1).fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<(usize, f32)> = candidates
        .iter()
        .map(|&(idx, logit)| (idx, (logit - max_logit).exp()))
        .collect();
    let sum: f32 = probs.iter().map(|c| c.1).sum();
    for c in &mut probs {
        c.1 /= sum;
    }

    if config.top_p < 1.0 {
        probs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
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

/// Greedy / multinomial sampler over host logits.
#[derive(Debug, Clone)]
pub struct LogitSampler {
    rng: XorShiftRng,
}

impl Default for LogitSampler {
    fn default() -> Self {
        Self::new(42)
    }
}

impl LogitSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: XorShiftRng::new(seed),
        }
    }

    /// Sampler seeded from `config`, falling back to the default seed.
    pub fn from_config(config: &SamplingConfig) -> Self {
        Self::new(config.seed.unwrap_or(42))
    }
}

impl Sampler for LogitSampler {
    fn sample(
        &mut self,
        sequences: &mut [SequenceState],
        logits: &Tensor,
        config: &GenerationConfig,
    ) -> Result<Vec<TokenId>, InferenceError> {
        let shape = logits.shape();
        if shape.len() != 3 || shape[0] < sequences.len() || shape[1] == 0 {
            return Err(InferenceError::Precondition(format!(
                "expected [batch >= {}, seq > 0, vocab] logits, got {:?}",
                sequences.len(),
                shape
            )));
        }
        let (rows, vocab) = (shape[1], shape[2]);
        let data = logits.to_f32_vec();
        let sampling = match config.strategy() {
            DecodingStrategy::Greedy => SamplingConfig::default(),
            DecodingStrategy::Multinomial => config.sampling.clone(),
            DecodingStrategy::BeamSearch => {
                return Err(InferenceError::Precondition(
                    "beam search is not supported by this sampler".to_string(),
                ))
            }
        };

        let mut chosen = Vec::new();
        for (b, seq) in sequences.iter_mut().enumerate() {
            if !seq.is_running() {
                continue;
            }
            let start = (b * rows + rows - 1) * vocab;
            let row = &data[start..start + vocab];
            let index = sample_token(row, &sampling, &mut self.rng);
            let token = index as TokenId;
            let lp = log_prob(row, index);

            if !config.ignore_eos && config.eos_token_id == Some(token) {
                seq.add_log_prob(lp);
                seq.finish(FinishReason::Eos);
            } else if config.stop_token_ids.contains(&token) {
                seq.add_log_prob(lp);
                seq.finish(FinishReason::StopToken);
            } else {
                seq.append(token, lp);
                if config
                    .max_new_tokens
                    .is_some_and(|max| seq.generated_ids().len() >= max)
                {
                    seq.finish(FinishReason::MaxNewTokens);
                }
            }
            trace!(token, log_prob = lp, "Sampled token");
            chosen.push(token);
        }
        Ok(chosen)
    }
}
