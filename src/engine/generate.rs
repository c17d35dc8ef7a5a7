//! Static-shape generation engine.
//!
//! [`GenerationEngine`] drives a compiled static LLM: one prefill inference over
//! the whole prompt, then one single-token inference per generated token until a
//! stop criterion, a streamer verdict, or cache exhaustion ends the sequence.
//! Only batch size 1 with greedy or multinomial decoding is supported.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::sampler::{
    FinishReason, GenerationConfig, LogitSampler, Sampler, SequenceState, TokenId,
};
use super::streamer::{Streamer, StreamingStatus};
use crate::backend::reference::map_blob;
use crate::backend::{CompiledArtifact, DeviceEngine, InferRequest};
use crate::config::hardware::NPU_DEVICE;
use crate::config::{
    derive_pipeline_config, HardwareDescriptor, ModelQuantization, PipelineConfig,
    PipelineOptions, WeightsPlacement,
};
use crate::error::InferenceError;
use crate::graph::ComputeGraph;
use crate::shaping::{kv_axes_position, KvAxesPosition};
use crate::tensor::Tensor;

/// Final state of a generate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GenerationStatus {
    /// EOS, a stop token or the token limit.
    Finished,
    /// The streamer asked to stop.
    Stopped,
    /// The streamer cancelled.
    Cancelled,
    /// The KV cache ran out of positions.
    OutOfMemory,
}

impl From<FinishReason> for GenerationStatus {
    fn from(reason: FinishReason) -> Self {
        match reason {
            FinishReason::Eos | FinishReason::StopToken | FinishReason::MaxNewTokens => {
                GenerationStatus::Finished
            }
            FinishReason::Stopped => GenerationStatus::Stopped,
            FinishReason::Cancelled => GenerationStatus::Cancelled,
            FinishReason::OutOfMemory => GenerationStatus::OutOfMemory,
        }
    }
}

impl std::fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationStatus::Finished => write!(f, "finished"),
            GenerationStatus::Stopped => write!(f, "stopped"),
            GenerationStatus::Cancelled => write!(f, "cancelled"),
            GenerationStatus::OutOfMemory => write!(f, "out_of_memory"),
        }
    }
}

/// Timing and token counts of one generate call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerfMetrics {
    pub load_time_ms: f64,
    pub num_input_tokens: usize,
    pub num_generated_tokens: usize,
    /// Start of the call to the first sampled token.
    pub ttft_ms: Option<f64>,
    /// Wall time of each decode step.
    pub token_latencies_ms: Vec<f64>,
    pub generate_duration_ms: f64,
}

impl PerfMetrics {
    /// Mean time per output token after the first.
    pub fn mean_tpot_ms(&self) -> Option<f64> {
        if self.token_latencies_ms.is_empty() {
            return None;
        }
        Some(self.token_latencies_ms.iter().sum::<f64>() / self.token_latencies_ms.len() as f64)
    }

    /// Generated tokens per second over the whole call.
    pub fn throughput(&self) -> Option<f64> {
        (self.generate_duration_ms > 0.0)
            .then(|| self.num_generated_tokens as f64 * 1000.0 / self.generate_duration_ms)
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Prompt tokens, optionally with their attention mask.
#[derive(Debug, Clone)]
pub struct EncodedInputs {
    /// `[batch, seq]` token ids.
    pub input_ids: Tensor,
    pub attention_mask: Option<Tensor>,
}

impl EncodedInputs {
    pub fn from_ids(ids: &[TokenId]) -> Self {
        Self {
            input_ids: Tensor::from_i64(vec![1, ids.len()], ids.to_vec()),
            attention_mask: None,
        }
    }
}

/// Output of [`GenerationEngine::generate`].
#[derive(Debug, Clone, Serialize)]
pub struct EncodedResults {
    /// One token list per returned sequence.
    pub tokens: Vec<Vec<TokenId>>,
    /// Cumulative log-probability per returned sequence.
    pub scores: Vec<f32>,
    pub status: GenerationStatus,
    pub metrics: PerfMetrics,
}

/// Position ids counting only attended tokens; masked slots get 0.
pub fn init_position_ids(attention_mask: &[i64]) -> Vec<i64> {
    let mut next = 0;
    attention_mask
        .iter()
        .map(|&m| {
            if m == 0 {
                0
            } else {
                next += 1;
                next - 1
            }
        })
        .collect()
}

/// Decode-step inputs, bound on the request once per call. Each step rewrites
/// the token and position slots and appends one mask entry in place; the mask
/// storage is reserved for the whole cache up front.
struct DecodeBuffers<'r> {
    request: &'r mut dyn InferRequest,
}

impl<'r> DecodeBuffers<'r> {
    fn bind(
        request: &'r mut dyn InferRequest,
        prompt_len: usize,
        capacity: usize,
    ) -> Result<Self, InferenceError> {
        let mut mask = Vec::with_capacity(capacity);
        mask.resize(prompt_len.saturating_sub(1), 1);
        request.set_tensor("input_ids", Tensor::from_i64(vec![1, 1], vec![0]))?;
        request.set_tensor("position_ids", Tensor::from_i64(vec![1, 1], vec![0]))?;
        request.set_tensor("attention_mask", Tensor::from_i64(vec![1, mask.len()], mask))?;
        Ok(Self { request })
    }

    /// Feed `token` at `position` and return the step's logits.
    fn step(&mut self, token: TokenId, position: usize) -> Result<Tensor, InferenceError> {
        self.request.input_mut("input_ids")?.as_i64_mut()[0] = token;
        self.request.input_mut("position_ids")?.as_i64_mut()[0] = position as i64;
        self.request.input_mut("attention_mask")?.append_i64(1)?;
        self.request.infer()?;
        self.request.get_tensor("logits")
    }
}

/// Generation loop over a compiled static LLM.
pub struct GenerationEngine {
    artifact: CompiledArtifact,
    request: Box<dyn InferRequest>,
    sampler: Box<dyn Sampler>,
    generation_config: GenerationConfig,
    load_time: Duration,
}

impl std::fmt::Debug for GenerationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationEngine")
            .field("artifact", &self.artifact)
            .field("generation_config", &self.generation_config)
            .finish_non_exhaustive()
    }
}

fn detect_and_derive(
    engine: &dyn DeviceEngine,
    options: &PipelineOptions,
    quant: &ModelQuantization,
    axes: KvAxesPosition,
) -> Result<PipelineConfig, InferenceError> {
    let hw = HardwareDescriptor::detect(engine);
    derive_pipeline_config(options, hw.as_ref(), quant, axes, WeightsPlacement::from_env())
}

impl GenerationEngine {
    /// Wrap an already compiled artifact.
    pub fn from_artifact(
        artifact: CompiledArtifact,
        generation_config: GenerationConfig,
    ) -> Result<Self, InferenceError> {
        let request = artifact.create_infer_request()?;
        let sampler = Box::new(LogitSampler::from_config(&generation_config.sampling));
        Ok(Self {
            artifact,
            request,
            sampler,
            generation_config,
            load_time: Duration::ZERO,
        })
    }

    /// Derive the device configuration for `graph` and compile it.
    pub fn from_graph(
        engine: &dyn DeviceEngine,
        graph: &ComputeGraph,
        options: &PipelineOptions,
        generation_config: GenerationConfig,
    ) -> Result<Self, InferenceError> {
        let start = Instant::now();
        let config = detect_and_derive(
            engine,
            options,
            &ModelQuantization::from_graph(graph),
            kv_axes_position(graph),
        )?;
        let artifact = engine.compile(graph, NPU_DEVICE, &config)?;
        let mut this = Self::from_artifact(artifact, generation_config)?;
        this.load_time = start.elapsed();
        info!(
            max_prompt_len = this.max_prompt_len(),
            kvcache_total = this.kvcache_total(),
            "Generation engine compiled"
        );
        Ok(this)
    }

    /// Import a previously exported artifact.
    pub fn from_blob(
        engine: &dyn DeviceEngine,
        path: &Path,
        options: &PipelineOptions,
        generation_config: GenerationConfig,
    ) -> Result<Self, InferenceError> {
        let start = Instant::now();
        if !path.exists() {
            return Err(InferenceError::Config(format!(
                "Blob file is not found at: {}",
                path.display()
            )));
        }
        let config = detect_and_derive(
            engine,
            options,
            &ModelQuantization::default(),
            KvAxesPosition::default(),
        )?;
        let mmap = map_blob(path)?;
        let mut bytes: &[u8] = &mmap;
        let artifact = engine.import(&mut bytes, NPU_DEVICE, &config)?;
        let mut this = Self::from_artifact(artifact, generation_config)?;
        this.load_time = start.elapsed();
        info!(path = %path.display(), "Generation engine imported from blob");
        Ok(this)
    }

    /// Build an engine from a property map.
    ///
    /// With `BLOB_PATH` set and `EXPORT_BLOB` off the artifact is imported from the
    /// blob and `graph` is not needed. Otherwise `graph` is compiled, and with
    /// `EXPORT_BLOB` on the artifact is written to `BLOB_PATH` (default
    /// `<models_dir>/model.blob`).
    pub fn load(
        engine: &dyn DeviceEngine,
        graph: Option<&ComputeGraph>,
        models_dir: &Path,
        properties: &BTreeMap<String, Value>,
        generation_config: GenerationConfig,
    ) -> Result<Self, InferenceError> {
        let options = PipelineOptions::from_map(properties)?;
        if let (Some(blob), false) = (&options.blob_path, options.export_blob) {
            return Self::from_blob(engine, blob, &options, generation_config);
        }

        let graph = graph.ok_or_else(|| {
            InferenceError::Config("a model graph is required unless BLOB_PATH is set".to_string())
        })?;
        let this = Self::from_graph(engine, graph, &options, generation_config)?;
        if options.export_blob {
            let path = options
                .blob_path
                .clone()
                .unwrap_or_else(|| models_dir.join("model.blob"));
            this.export_blob(&path)?;
        }
        Ok(this)
    }

    /// Write the compiled artifact to `path`, which must end in `.blob`.
    pub fn export_blob(&self, path: &Path) -> Result<PathBuf, InferenceError> {
        if path.extension().and_then(|e| e.to_str()) != Some("blob") {
            return Err(InferenceError::Config(format!(
                "Please provide a full path to blob file in BLOB_PATH: {}",
                path.display()
            )));
        }
        let mut writer = BufWriter::new(File::create(path)?);
        self.artifact.export(&mut writer)?;
        writer.flush()?;
        info!(path = %path.display(), "Exported blob");
        Ok(path.to_path_buf())
    }

    /// Replace the default [`LogitSampler`].
    pub fn with_sampler(mut self, sampler: Box<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn max_prompt_len(&self) -> usize {
        self.artifact.max_prompt_len()
    }

    pub fn kvcache_total(&self) -> usize {
        self.artifact.kvcache_total()
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation_config
    }

    pub fn set_generation_config(&mut self, config: GenerationConfig) {
        self.generation_config = config;
    }

    pub fn artifact(&self) -> &CompiledArtifact {
        &self.artifact
    }

    /// Generate a continuation of `inputs`.
    ///
    /// Unset stop criteria in `config` are taken from the engine's default
    /// configuration. Stop, cancel and cache exhaustion end generation early and
    /// still return the tokens produced so far.
    pub fn generate(
        &mut self,
        inputs: &EncodedInputs,
        config: Option<&GenerationConfig>,
        streamer: &mut dyn Streamer,
    ) -> Result<EncodedResults, InferenceError> {
        let start = Instant::now();
        let config = match config {
            Some(c) => c.clone().with_defaults_from(&self.generation_config),
            None => self.generation_config.clone(),
        };
        config.validate()?;

        let ids = &inputs.input_ids;
        let batch = ids.shape().first().copied().unwrap_or(0);
        if ids.rank() != 2 || batch != 1 {
            return Err(InferenceError::Precondition(format!(
                "Currently only batch size=1 is supported, got input_ids {:?}",
                ids.shape()
            )));
        }
        if !(config.is_greedy_decoding() || config.is_multinomial()) {
            return Err(InferenceError::Precondition(
                "Currently only greedy and multinomial decoding are supported".to_string(),
            ));
        }
        if config.num_return_sequences != 1 {
            return Err(InferenceError::Precondition(
                "Currently only \"num_return_sequences\" equal to 1 is supported!".to_string(),
            ));
        }
        let prompt: Vec<TokenId> = ids.to_i64_vec();
        let prompt_len = prompt.len();
        if prompt_len == 0 {
            return Err(InferenceError::Precondition("prompt is empty".to_string()));
        }
        let max_prompt_len = self.max_prompt_len();
        if prompt_len > max_prompt_len {
            return Err(InferenceError::Capacity(format!(
                "Static LLM pipeline may only process prompts up to {} tokens. \
                 Set the \"MAX_PROMPT_LEN\" config option to increase the limit.",
                max_prompt_len
            )));
        }
        let mask = match &inputs.attention_mask {
            Some(m) if m.n_elements() == prompt_len => m.to_i64_vec(),
            Some(m) => {
                return Err(InferenceError::ShapeMismatch {
                    expected: ids.shape().to_vec(),
                    actual: m.shape().to_vec(),
                })
            }
            None => vec![1; prompt_len],
        };
        let positions = init_position_ids(&mask);

        let mut metrics = PerfMetrics {
            load_time_ms: millis(self.load_time),
            num_input_tokens: prompt_len,
            ..PerfMetrics::default()
        };

        let total = self.kvcache_total();

        // Prefill.
        let request = self.request.as_mut();
        request.set_tensor("input_ids", Tensor::from_i64(vec![1, prompt_len], prompt.clone()))?;
        request.set_tensor("attention_mask", Tensor::from_i64(vec![1, prompt_len], mask))?;
        request.set_tensor("position_ids", Tensor::from_i64(vec![1, prompt_len], positions))?;
        request.infer()?;
        let logits = prompt_logits(request.get_tensor("logits")?, prompt_len)?;

        let mut sequences = vec![SequenceState::new(prompt)];
        self.sampler.sample(&mut sequences, &logits, &config)?;
        metrics.ttft_ms = Some(millis(start.elapsed()));
        stream_new_token(&mut sequences[0], 0, streamer);
        debug!(prompt_len, "Prefill complete, starting decode");

        let mut buffers = DecodeBuffers::bind(request, prompt_len, total)?;
        while sequences[0].is_running() {
            let Some(position) = sequences[0].next_input_position() else {
                break;
            };
            if position >= total {
                debug!(position, "KV cache exhausted");
                sequences[0].finish(FinishReason::OutOfMemory);
                break;
            }
            let Some(last) = sequences[0].last_token() else {
                break;
            };
            let step_start = Instant::now();
            let logits = buffers.step(last, position)?;

            let before = sequences[0].generated_ids().len();
            self.sampler.sample(&mut sequences, &logits, &config)?;
            metrics.token_latencies_ms.push(millis(step_start.elapsed()));
            stream_new_token(&mut sequences[0], before, streamer);
        }
        streamer.end();

        let sequence = &sequences[0];
        let status = sequence
            .finish_reason()
            .map(GenerationStatus::from)
            .unwrap_or(GenerationStatus::Finished);
        metrics.num_generated_tokens = sequence.generated_ids().len();
        metrics.generate_duration_ms = millis(start.elapsed());
        info!(
            prompt_len,
            generated = metrics.num_generated_tokens,
            %status,
            "Generation finished"
        );
        Ok(EncodedResults {
            tokens: vec![sequence.generated_ids().to_vec()],
            scores: vec![sequence.cumulative_log_prob()],
            status,
            metrics,
        })
    }
}

/// Logits rows for the real prompt. A device that returns padded logits (no
/// slice-out) gives `[1, padded, vocab]`; only the last `prompt_len` rows are real.
fn prompt_logits(padded: Tensor, prompt_len: usize) -> Result<Tensor, InferenceError> {
    let rows = padded.shape().get(1).copied().unwrap_or(0);
    if padded.rank() != 3 || rows == 0 {
        return Err(InferenceError::Backend(format!(
            "unexpected logits shape {:?}",
            padded.shape()
        )));
    }
    if rows > 1 {
        let keep = prompt_len.min(rows);
        return padded.slice(1, rows - keep, rows);
    }
    Ok(padded)
}

/// Push the token appended by the last sample, if any, and apply the verdict.
fn stream_new_token(sequence: &mut SequenceState, before: usize, streamer: &mut dyn Streamer) {
    if sequence.generated_ids().len() <= before {
        return;
    }
    let Some(token) = sequence.last_token() else {
        return;
    };
    match streamer.write(token) {
        StreamingStatus::Running => {}
        StreamingStatus::Stop => sequence.finish(FinishReason::Stopped),
        StreamingStatus::Cancel => {
            sequence.discard_last();
            sequence.set_finished(FinishReason::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::io::Read;
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::backend::reference::ReferenceEngine;
    use crate::backend::Executable;
    use crate::engine::streamer::{NoopStreamer, TokenCallbackStreamer};
    use crate::model::{build_decoder, DecoderConfig};

    /// Records every infer call; logits always favour `next_token`.
    #[derive(Default)]
    struct ScriptState {
        infers: usize,
        masks: Vec<usize>,
        /// Address of the mask data at each infer.
        mask_storage: Vec<usize>,
        positions: Vec<i64>,
        binds: usize,
    }


    struct ScriptedRequest {
        state: Arc<Mutex<ScriptState>>,
        inputs: BTreeMap<String, Tensor>,
        vocab: usize,
        next_token: usize,
        padded_rows: usize,
    }

    impl InferRequest for ScriptedRequest {
        fn set_tensor(&mut self, name: &str, tensor: Tensor) -> Result<(), InferenceError> {
            self.state.lock().unwrap().binds += 1;
            self.inputs.insert(name.to_string(), tensor);
            Ok(())
        }

        fn input_mut(&mut self, name: &str) -> Result<&mut Tensor, InferenceError> {
            self.inputs
                .get_mut(name)
                .ok_or_else(|| InferenceError::TensorNotFound(name.to_string()))
        }

        fn get_tensor(&self, name: &str) -> Result<Tensor, InferenceError> {
            if name != "logits" {
                return Err(InferenceError::TensorNotFound(name.to_string()));
            }
            let len = self.inputs["input_ids"].n_elements();
            let rows = if len > 1 { self.padded_rows.max(len) } else { 1 };
            let mut data = vec![0.0; rows * self.vocab];
            for r in 0..rows {
                data[r * self.vocab + self.next_token] = 5.0;
            }
            Ok(Tensor::new(vec![1, rows, self.vocab], data))
        }

        fn infer(&mut self) -> Result<(), InferenceError> {
            let mut state = self.state.lock().unwrap();
            state.infers += 1;
            state.masks.push(self.inputs["attention_mask"].n_elements());
            state
                .mask_storage
                .push(self.inputs["attention_mask"].as_i64().as_ptr() as usize);
            state.positions.push(self.inputs["position_ids"].to_i64_vec()[0]);
            Ok(())
        }
    }

    struct ScriptedExecutable {
        state: Arc<Mutex<ScriptState>>,
        next_token: usize,
        padded_rows: usize,
    }

    impl Executable for ScriptedExecutable {
        fn create_infer_request(&self) -> Result<Box<dyn InferRequest>, InferenceError> {
            Ok(Box::new(ScriptedRequest {
                state: self.state.clone(),
                inputs: BTreeMap::new(),
                vocab: 8,
                next_token: self.next_token,
                padded_rows: self.padded_rows,
            }))
        }

        fn export(&self, _writer: &mut dyn Write) -> Result<(), InferenceError> {
            Ok(())
        }
    }

    fn scripted(
        max_prompt_len: usize,
        min_response_len: usize,
        next_token: usize,
    ) -> (GenerationEngine, Arc<Mutex<ScriptState>>) {
        let state = Arc::new(Mutex::new(ScriptState::default()));
        let exe = ScriptedExecutable {
            state: state.clone(),
            next_token,
            padded_rows: max_prompt_len,
        };
        let artifact = CompiledArtifact::new(NPU_DEVICE, max_prompt_len, min_response_len, Arc::new(exe));
        let engine = GenerationEngine::from_artifact(artifact, GenerationConfig::greedy()).unwrap();
        (engine, state)
    }

    #[test]
    fn test_prompt_too_long_rejected_before_inference() {
        let (mut engine, state) = scripted(4, 4, 1);
        let err = engine
            .generate(&EncodedInputs::from_ids(&[1, 2, 3, 4, 5]), None, &mut NoopStreamer)
            .unwrap_err();
        assert!(matches!(err, InferenceError::Capacity(_)));
        assert_eq!(state.lock().unwrap().infers, 0);
    }

    #[test]
    fn test_out_of_memory_exactly_at_capacity() {
        // 3 prompt tokens, 8 positions in total: positions 3..=7 take generated
        // tokens, so the loop feeds 5 decode steps and stops with 6 tokens.
        let (mut engine, state) = scripted(4, 4, 1);
        let result = engine
            .generate(&EncodedInputs::from_ids(&[5, 6, 7]), None, &mut NoopStreamer)
            .unwrap();
        assert_eq!(result.status, GenerationStatus::OutOfMemory);
        let state = state.lock().unwrap();
        assert_eq!(state.infers, 1 + 5);
        assert_eq!(*state.positions.last().unwrap(), 7, "last fed position is C - 1");
        assert_eq!(state.masks[1..], [3, 4, 5, 6, 7]);
        assert_eq!(result.tokens[0].len(), 6);
        assert_eq!(result.metrics.num_generated_tokens, 6);
        assert_eq!(result.metrics.token_latencies_ms.len(), 5);
    }

    #[test]
    fn test_decode_inputs_updated_in_place() {
        let (mut engine, state) = scripted(4, 12, 1);
        let result = engine
            .generate(&EncodedInputs::from_ids(&[5, 6]), None, &mut NoopStreamer)
            .unwrap();
        assert_eq!(result.status, GenerationStatus::OutOfMemory);
        let state = state.lock().unwrap();
        assert_eq!(state.binds, 6, "three prefill inputs, three decode inputs");
        let decode_storage = &state.mask_storage[1..];
        assert_eq!(decode_storage.len(), 14);
        assert!(
            decode_storage.iter().all(|&p| p == decode_storage[0]),
            "mask grows inside its reserved storage"
        );
        assert_eq!(state.positions[1..].to_vec(), (2..16).collect::<Vec<i64>>());
    }

    #[test]
    fn test_cancel_at_step_k() {
        let (mut engine, state) = scripted(8, 32, 3);
        let mut writes = 0;
        let mut streamer = TokenCallbackStreamer::new(|_| {
            writes += 1;
            if writes == 3 {
                StreamingStatus::Cancel
            } else {
                StreamingStatus::Running
            }
        });
        let result = engine
            .generate(&EncodedInputs::from_ids(&[1, 2]), None, &mut streamer)
            .unwrap();
        drop(streamer);
        assert_eq!(writes, 3);
        assert_eq!(result.status, GenerationStatus::Cancelled);
        assert_eq!(result.tokens[0].len(), 2, "cancelled token is discarded");
        let token_log_prob = 5.0 - (5.0f32.exp() + 7.0).ln();
        assert!(
            (result.scores[0] - 2.0 * token_log_prob).abs() < 1e-4,
            "score covers only the returned tokens, got {}",
            result.scores[0]
        );
        assert_eq!(state.lock().unwrap().infers, 3, "no inference after cancel");
    }

    #[test]
    fn test_stop_keeps_current_token() {
        let (mut engine, state) = scripted(8, 32, 3);
        let mut streamer = TokenCallbackStreamer::new(|_| StreamingStatus::Stop);
        let result = engine
            .generate(&EncodedInputs::from_ids(&[1]), None, &mut streamer)
            .unwrap();
        assert_eq!(result.status, GenerationStatus::Stopped);
        assert_eq!(result.tokens[0], vec![3]);
        assert_eq!(state.lock().unwrap().infers, 1);
    }

    #[test]
    fn test_eos_and_max_new_tokens() {
        let (mut engine, _) = scripted(8, 32, 2);
        let config = GenerationConfig {
            eos_token_id: Some(2),
            ..GenerationConfig::greedy()
        };
        let result = engine
            .generate(&EncodedInputs::from_ids(&[1, 1]), Some(&config), &mut NoopStreamer)
            .unwrap();
        assert_eq!(result.status, GenerationStatus::Finished);
        assert!(result.tokens[0].is_empty());
        assert!(result.scores[0] < 0.0);

        let config = GenerationConfig {
            max_new_tokens: Some(4),
            ..GenerationConfig::greedy()
        };
        let result = engine
            .generate(&EncodedInputs::from_ids(&[1, 1]), Some(&config), &mut NoopStreamer)
            .unwrap();
        assert_eq!(result.status, GenerationStatus::Finished);
        assert_eq!(result.tokens[0], vec![2; 4]);
    }

    #[test]
    fn test_default_config_supplies_stop_ids() {
        let (engine, _) = scripted(8, 32, 5);
        let mut engine = GenerationEngine {
            generation_config: GenerationConfig {
                stop_token_ids: BTreeSet::from([5]),
                ..GenerationConfig::greedy()
            },
            ..engine
        };
        let result = engine
            .generate(
                &EncodedInputs::from_ids(&[1]),
                Some(&GenerationConfig::greedy()),
                &mut NoopStreamer,
            )
            .unwrap();
        assert!(result.tokens[0].is_empty());
        assert_eq!(result.status, GenerationStatus::Finished);
    }

    #[test]
    fn test_preconditions() {
        let (mut engine, state) = scripted(8, 8, 1);
        let batch2 = EncodedInputs {
            input_ids: Tensor::from_i64(vec![2, 1], vec![1, 2]),
            attention_mask: None,
        };
        assert!(matches!(
            engine.generate(&batch2, None, &mut NoopStreamer),
            Err(InferenceError::Precondition(_))
        ));
        let beams = GenerationConfig {
            num_beams: 2,
            ..GenerationConfig::greedy()
        };
        assert!(engine
            .generate(&EncodedInputs::from_ids(&[1]), Some(&beams), &mut NoopStreamer)
            .is_err());
        let many = GenerationConfig {
            num_return_sequences: 2,
            ..GenerationConfig::greedy()
        };
        assert!(engine
            .generate(&EncodedInputs::from_ids(&[1]), Some(&many), &mut NoopStreamer)
            .is_err());
        assert!(engine
            .generate(&EncodedInputs::from_ids(&[]), None, &mut NoopStreamer)
            .is_err());
        assert_eq!(state.lock().unwrap().infers, 0);
    }

    #[test]
    fn test_padded_prefill_logits_sliced_to_prompt() {
        let padded = Tensor::new(vec![1, 4, 2], vec![0., 0., 0., 0., 1., 0., 0., 1.]);
        let sliced = prompt_logits(padded, 2).unwrap();
        assert_eq!(sliced.shape(), &[1, 2, 2]);
        assert_eq!(sliced.to_f32_vec(), vec![1., 0., 0., 1.]);
    }

    #[test]
    fn test_position_ids_skip_masked() {
        assert_eq!(init_position_ids(&[0, 0, 1, 1, 1]), vec![0, 0, 0, 1, 2]);
        assert_eq!(init_position_ids(&[1, 1]), vec![0, 1]);
    }

    #[test]
    fn test_engine_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<GenerationEngine>();
    }

    fn decoder_options(prompt: usize, response: usize) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("MAX_PROMPT_LEN".to_string(), json!(prompt)),
            ("MIN_RESPONSE_LEN".to_string(), json!(response)),
        ])
    }

    #[test]
    fn test_end_to_end_reference_device() {
        let graph = build_decoder(&DecoderConfig::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = GenerationConfig {
            eos_token_id: Some(2),
            ..GenerationConfig::greedy()
        };
        let mut engine = GenerationEngine::load(
            &ReferenceEngine::new(),
            Some(&graph),
            dir.path(),
            &decoder_options(1024, 128),
            config,
        )
        .unwrap();
        assert_eq!(engine.kvcache_total(), 1152);

        let prompt: Vec<TokenId> = (0..10).map(|i| (i * 3 + 1) % 32).collect();
        let mut streamed = Vec::new();
        let mut streamer = TokenCallbackStreamer::new(|t| {
            streamed.push(t);
            StreamingStatus::Running
        });
        let result = engine
            .generate(&EncodedInputs::from_ids(&prompt), None, &mut streamer)
            .unwrap();
        drop(streamer);

        let tokens = &result.tokens[0];
        assert!(
            matches!(result.status, GenerationStatus::Finished | GenerationStatus::OutOfMemory),
            "ends at EOS or cache exhaustion, got {}",
            result.status
        );
        // The token sampled at position C - 1 is returned but never fed back.
        assert!(prompt.len() + tokens.len() - 1 <= 1152);
        if result.status == GenerationStatus::OutOfMemory {
            assert_eq!(tokens.len(), 1152 - prompt.len() + 1);
        }
        assert!(!tokens.contains(&2), "EOS is not part of the output");
        assert_eq!(&streamed, tokens);
        assert!(result.scores[0].is_finite());
        assert!(result.metrics.ttft_ms.is_some());
    }

    #[test]
    fn test_blob_export_then_import() {
        let graph = build_decoder(&DecoderConfig::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let device = ReferenceEngine::new();
        let mut props = decoder_options(8, 8);
        props.insert("EXPORT_BLOB".to_string(), json!("YES"));
        let config = GenerationConfig {
            max_new_tokens: Some(3),
            ..GenerationConfig::greedy()
        };

        let mut compiled =
            GenerationEngine::load(&device, Some(&graph), dir.path(), &props, config.clone()).unwrap();
        let blob = dir.path().join("model.blob");
        assert!(blob.exists());
        let mut header = [0u8; 8];
        File::open(&blob).unwrap().read_exact(&mut header).unwrap();
        assert_eq!(&header, b"STRLMBLB");

        let props = BTreeMap::from([("BLOB_PATH".to_string(), json!(blob.to_string_lossy()))]);
        let mut imported = GenerationEngine::load(&device, None, dir.path(), &props, config).unwrap();
        assert_eq!(imported.max_prompt_len(), 8, "capacity comes from the blob");

        let inputs = EncodedInputs::from_ids(&[4, 5, 6]);
        let a = compiled.generate(&inputs, None, &mut NoopStreamer).unwrap();
        let b = imported.generate(&inputs, None, &mut NoopStreamer).unwrap();
        assert_eq!(a.tokens, b.tokens);
    }

    #[test]
    fn test_blob_errors() {
        let graph = build_decoder(&DecoderConfig::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let device = ReferenceEngine::new();

        let missing = BTreeMap::from([(
            "BLOB_PATH".to_string(),
            json!(dir.path().join("absent.blob").to_string_lossy()),
        )]);
        let err = GenerationEngine::load(&device, None, dir.path(), &missing, GenerationConfig::greedy())
            .unwrap_err();
        assert!(err.to_string().contains("not found"));

        let mut bad_ext = decoder_options(4, 4);
        bad_ext.insert("EXPORT_BLOB".to_string(), json!(true));
        bad_ext.insert(
            "BLOB_PATH".to_string(),
            json!(dir.path().join("model.bin").to_string_lossy()),
        );
        assert!(matches!(
            GenerationEngine::load(&device, Some(&graph), dir.path(), &bad_ext, GenerationConfig::greedy()),
            Err(InferenceError::Config(_))
        ));

        assert!(
            GenerationEngine::load(&device, None, dir.path(), &decoder_options(4, 4), GenerationConfig::greedy())
                .is_err(),
            "compiling needs a graph"
        );
    }
}
