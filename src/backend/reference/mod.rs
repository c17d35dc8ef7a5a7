//! Reference CPU device.
//!
//! Implements the static LLM compilation flow on the host: the model is split
//! into a prefill variant sized to the max prompt length and a single-token
//! generate variant sized to the full cache window. An infer request keeps the
//! KV cache between calls and decides per call which variant to run.
//!
//! Exported artifacts are `STRLMBLB` followed by a JSON document of the compiled
//! model.

pub mod eval;

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::{CompiledArtifact, DeviceEngine, Executable, InferRequest};
use crate::config::hardware::NPU_DEVICE;
use crate::config::{CacheMode, HardwareDescriptor, PipelineConfig};
use crate::error::InferenceError;
use crate::graph::ComputeGraph;
use crate::rewrite::{
    align_u4_zp_constants, cvt_kvcache_to_fp16, cvt_value_tensors_layout, decompose_attention,
    optimize_value_tensors,
};
use crate::shaping::{
    redirect_new_kv_to_output, reshape_to_static, KvCacheLayout, KV_INPUT_PATTERN,
    KV_OUTPUT_PATTERN,
};
use crate::tensor::{ElementType, Tensor};

/// Leading bytes of every exported artifact.
pub const BLOB_MAGIC: &[u8; 8] = b"STRLMBLB";

/// Memory-map an exported artifact for [`DeviceEngine::import`].
pub fn map_blob(path: &Path) -> Result<memmap2::Mmap, InferenceError> {
    let file = File::open(path).map_err(|e| {
        InferenceError::Blob(format!("cannot open blob '{}': {}", path.display(), e))
    })?;
    // SAFETY: the mapping is read-only and only lives for the duration of an
    // import; the blob is not modified while mapped.
    let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };
    debug!(path = %path.display(), bytes = mmap.len(), "Mapped blob");
    Ok(mmap)
}

/// Host implementation of [`DeviceEngine`].
#[derive(Debug, Clone)]
pub struct ReferenceEngine {
    devices: Vec<String>,
    descriptor: HardwareDescriptor,
}

impl Default for ReferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceEngine {
    /// Engine exposing `NPU` and `CPU` with a 2-tile 3720 descriptor.
    pub fn new() -> Self {
        Self {
            devices: vec![NPU_DEVICE.to_string(), "CPU".to_string()],
            descriptor: HardwareDescriptor {
                arch: "3720".to_string(),
                max_tiles: 2,
                compiler_dq: false,
            },
        }
    }

    pub fn with_devices(mut self, devices: &[&str]) -> Self {
        self.devices = devices.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_descriptor(mut self, descriptor: HardwareDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    fn check_device(&self, device: &str) -> Result<(), InferenceError> {
        if self.devices.iter().any(|d| d == device) {
            Ok(())
        } else {
            Err(InferenceError::Backend(format!(
                "device '{}' is not available (have {:?})",
                device, self.devices
            )))
        }
    }
}

/// Directory of the compiled-artifact cache, if caching applies.
fn artifact_cache_dir(config: &PipelineConfig) -> Option<PathBuf> {
    if config.cache_mode == Some(CacheMode::OptimizeSize) {
        return None;
    }
    config
        .common
        .cache_dir
        .as_deref()
        .or_else(|| config.common.extra.get("CACHE_DIR").map(String::as_str))
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
}

fn artifact_cache_key(graph: &ComputeGraph, config: &PipelineConfig) -> Result<String, InferenceError> {
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(graph)?.hash(&mut hasher);
    serde_json::to_string(config)?.hash(&mut hasher);
    Ok(format!("{:016x}", hasher.finish()))
}

impl DeviceEngine for ReferenceEngine {
    fn name(&self) -> &str {
        "reference"
    }

    fn available_devices(&self) -> Vec<String> {
        self.devices.clone()
    }

    fn hardware_descriptor(&self, device: &str) -> Option<HardwareDescriptor> {
        (device == NPU_DEVICE && self.devices.iter().any(|d| d == device))
            .then(|| self.descriptor.clone())
    }

    fn compile(
        &self,
        graph: &ComputeGraph,
        device: &str,
        config: &PipelineConfig,
    ) -> Result<CompiledArtifact, InferenceError> {
        self.check_device(device)?;

        let cached_path = match artifact_cache_dir(config) {
            Some(dir) => Some(dir.join(format!("{}.blob", artifact_cache_key(graph, config)?))),
            None => None,
        };
        if let Some(path) = cached_path.as_deref().filter(|p| p.exists()) {
            info!(path = %path.display(), "Loading compiled model from cache");
            let mmap = map_blob(path)?;
            let mut bytes: &[u8] = &mmap;
            return self.import(&mut bytes, device, config);
        }

        let model = StaticModel::compile(graph, config)?;
        let artifact = model.into_artifact(device);

        if let Some(path) = cached_path {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut writer = BufWriter::new(File::create(&path)?);
            artifact.export(&mut writer)?;
            writer.flush()?;
            info!(path = %path.display(), "Stored compiled model in cache");
        }
        Ok(artifact)
    }

    fn import(
        &self,
        reader: &mut dyn Read,
        device: &str,
        _config: &PipelineConfig,
    ) -> Result<CompiledArtifact, InferenceError> {
        self.check_device(device)?;
        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .map_err(|e| InferenceError::Blob(format!("truncated blob header: {}", e)))?;
        if &magic != BLOB_MAGIC {
            return Err(InferenceError::Blob(format!(
                "bad blob magic {:02x?}, expected {:02x?}",
                magic, BLOB_MAGIC
            )));
        }
        let mut model: StaticModel = serde_json::from_reader(reader)
            .map_err(|e| InferenceError::Blob(format!("malformed blob payload: {}", e)))?;
        model.prefill.validate()?;
        model.generate.validate()?;
        info!(
            max_prompt_len = model.max_prompt_len,
            min_response_len = model.min_response_len,
            "Imported compiled model"
        );
        Ok(model.into_artifact(device))
    }
}

/// Both static variants of a model plus what the runtime needs to drive them.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StaticModel {
    prefill: ComputeGraph,
    generate: ComputeGraph,
    /// Cache layout shared by prefill outputs and generate inputs.
    layout: KvCacheLayout,
    max_prompt_len: usize,
    min_response_len: usize,
    slice_out: bool,
}

impl StaticModel {
    fn compile(graph: &ComputeGraph, config: &PipelineConfig) -> Result<Self, InferenceError> {
        let llm = &config.llm;
        if !llm.enabled {
            return Err(InferenceError::Config(
                "the reference device only compiles in static LLM mode (NPUW_LLM)".to_string(),
            ));
        }
        if llm.max_prompt_len == 0 {
            return Err(InferenceError::Config("max prompt length must be positive".to_string()));
        }
        let prompt = llm.max_prompt_len;
        let total = llm.kvcache_total();

        let mut generate = graph.clone();
        let report = optimize_value_tensors(&mut generate)?;
        let mut prefill = graph.clone();
        decompose_attention(&mut prefill)?;

        let layout = KvCacheLayout::new(llm.axes(), report.values_transposed);
        reshape_to_static(&mut prefill, prompt, prompt, &KvCacheLayout::new(llm.axes(), false))?;
        reshape_to_static(&mut generate, 1, total, &layout)?;
        redirect_new_kv_to_output(&mut prefill)?;
        redirect_new_kv_to_output(&mut generate)?;
        if report.values_transposed {
            cvt_value_tensors_layout(&mut prefill)?;
        }
        for g in [&mut prefill, &mut generate] {
            cvt_kvcache_to_fp16(g)?;
            align_u4_zp_constants(g)?;
        }

        let slice_out = config.prefill.slice_out.unwrap_or(false);
        info!(
            max_prompt_len = prompt,
            kvcache_total = total,
            values_transposed = report.values_transposed,
            slice_out,
            "Compiled static LLM"
        );
        Ok(Self {
            prefill,
            generate,
            layout,
            max_prompt_len: prompt,
            min_response_len: llm.min_response_len,
            slice_out,
        })
    }

    fn into_artifact(self, device: &str) -> CompiledArtifact {
        let (prompt, response) = (self.max_prompt_len, self.min_response_len);
        CompiledArtifact::new(
            device,
            prompt,
            response,
            Arc::new(ReferenceExecutable {
                model: Arc::new(self),
            }),
        )
    }

    fn kvcache_total(&self) -> usize {
        self.max_prompt_len + self.min_response_len
    }
}

struct ReferenceExecutable {
    model: Arc<StaticModel>,
}

impl Executable for ReferenceExecutable {
    fn create_infer_request(&self) -> Result<Box<dyn InferRequest>, InferenceError> {
        Ok(Box::new(ReferenceInferRequest::new(self.model.clone())?))
    }

    fn export(&self, writer: &mut dyn Write) -> Result<(), InferenceError> {
        writer.write_all(BLOB_MAGIC)?;
        serde_json::to_writer(&mut *writer, self.model.as_ref())?;
        debug!("Exported compiled model");
        Ok(())
    }
}

/// Device-resident cache for one `past_key_values` input.
struct CacheSlot {
    input: String,
    output: String,
    seq_axis: usize,
    buffer: Tensor,
}

struct ReferenceInferRequest {
    model: Arc<StaticModel>,
    inputs: BTreeMap<String, Tensor>,
    outputs: BTreeMap<String, Tensor>,
    cache: Vec<CacheSlot>,
    /// Positions currently held in the cache.
    cached: usize,
}

impl ReferenceInferRequest {
    fn new(model: Arc<StaticModel>) -> Result<Self, InferenceError> {
        let mut cache = Vec::new();
        for &p in model.generate.parameters() {
            let node = model.generate.node(p);
            if !node.name.contains(KV_INPUT_PATTERN) {
                continue;
            }
            let shape = node.output.shape.to_static().ok_or_else(|| {
                InferenceError::Graph(format!("cache input '{}' is not static", node.name))
            })?;
            let output = node.name.replacen(KV_INPUT_PATTERN, KV_OUTPUT_PATTERN, 1);
            if model.generate.result_by_name(&output).is_none() {
                return Err(InferenceError::Graph(format!(
                    "cache input '{}' has no matching output '{}'",
                    node.name, output
                )));
            }
            cache.push(CacheSlot {
                input: node.name.clone(),
                output,
                seq_axis: model.layout.seq_axis(&node.name),
                buffer: Tensor::zeros(&shape, node.output.element_type),
            });
        }
        Ok(Self {
            model,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            cache,
            cached: 0,
        })
    }

    fn input(&self, name: &str) -> Result<&Tensor, InferenceError> {
        self.inputs
            .get(name)
            .ok_or_else(|| InferenceError::TensorNotFound(name.to_string()))
    }

    fn output(outputs: &BTreeMap<String, Tensor>, name: &str) -> Result<Tensor, InferenceError> {
        outputs
            .get(name)
            .cloned()
            .ok_or_else(|| InferenceError::TensorNotFound(name.to_string()))
    }

    /// Run the prompt right-aligned in the prefill window and seed the cache with
    /// its last `len` positions.
    fn prefill(&mut self, ids: &Tensor) -> Result<(), InferenceError> {
        let window = self.model.max_prompt_len;
        let len = ids.n_elements();
        if len == 0 {
            return Err(InferenceError::Precondition("empty prompt".to_string()));
        }
        if len > window {
            return Err(InferenceError::Capacity(format!(
                "prompt of {} tokens exceeds the compiled window of {}",
                len, window
            )));
        }
        let pad = window - len;
        let mask = self.input("attention_mask")?.convert(ElementType::I64);
        if mask.n_elements() > window {
            return Err(InferenceError::Capacity(format!(
                "attention mask of {} entries exceeds the compiled window of {}",
                mask.n_elements(),
                window
            )));
        }

        let right_aligned = |src: &Tensor| -> Result<Tensor, InferenceError> {
            let mut padded = Tensor::zeros(&[1, window], ElementType::I64);
            padded.copy_with_offset(&src.convert(ElementType::I64), window - src.n_elements())?;
            Ok(padded)
        };
        let mut feed = BTreeMap::new();
        feed.insert("input_ids".to_string(), right_aligned(ids)?);
        feed.insert("position_ids".to_string(), right_aligned(self.input("position_ids")?)?);
        feed.insert("attention_mask".to_string(), right_aligned(&mask)?);
        for &p in self.model.prefill.parameters() {
            let node = self.model.prefill.node(p);
            if node.name.contains(KV_INPUT_PATTERN) {
                let shape = node.output.shape.to_static().ok_or_else(|| {
                    InferenceError::Graph(format!("prefill input '{}' is not static", node.name))
                })?;
                feed.insert(node.name.clone(), Tensor::zeros(&shape, node.output.element_type));
            }
        }

        let outputs = eval::evaluate(&self.model.prefill, &feed)?;
        for slot in &mut self.cache {
            let present = Self::output(&outputs, &slot.output)?;
            slot.buffer = Tensor::zeros(slot.buffer.shape(), slot.buffer.element_type());
            let kept = len.min(slot.buffer.shape()[slot.seq_axis]);
            slot.buffer
                .copy_along_axis(slot.seq_axis, 0, &present, pad, kept)?;
        }
        self.cached = len;

        let logits = Self::output(&outputs, "logits")?;
        let logits = if self.model.slice_out {
            logits.slice(1, window - 1, window)?
        } else {
            logits
        };
        trace!(len, pad, "Prefill step");
        self.outputs.insert("logits".to_string(), logits);
        Ok(())
    }

    /// Run one token against the cache and append its entries at `cached`.
    fn decode(&mut self, ids: &Tensor) -> Result<(), InferenceError> {
        let total = self.model.kvcache_total();
        if ids.n_elements() != 1 {
            return Err(InferenceError::Precondition(format!(
                "a generate step takes one token, got {}",
                ids.n_elements()
            )));
        }
        if self.cached >= total {
            return Err(InferenceError::Capacity(format!(
                "KV cache is full ({} of {} positions)",
                self.cached, total
            )));
        }

        // Mask entries cover the cached positions, optionally followed by the
        // current token. Past slots are [0, cached); the current token sits in the
        // last slot.
        let mask = self.input("attention_mask")?.to_i64_vec();
        if mask.len() > self.cached + 1 {
            return Err(InferenceError::Precondition(format!(
                "attention mask has {} entries, cache holds {}",
                mask.len(),
                self.cached
            )));
        }
        let past = mask.len().min(self.cached);
        let mut full_mask = vec![0i64; total];
        full_mask[..past].copy_from_slice(&mask[..past]);
        full_mask[total - 1] = mask.get(self.cached).copied().unwrap_or(1);

        let mut feed = BTreeMap::new();
        feed.insert("input_ids".to_string(), ids.convert(ElementType::I64).reshape(&[1, 1]));
        feed.insert(
            "position_ids".to_string(),
            self.input("position_ids")?.convert(ElementType::I64).reshape(&[1, 1]),
        );
        feed.insert("attention_mask".to_string(), Tensor::from_i64(vec![1, total], full_mask));
        for slot in &self.cache {
            feed.insert(slot.input.clone(), slot.buffer.clone());
        }

        let outputs = eval::evaluate(&self.model.generate, &feed)?;
        let at = self.cached;
        for slot in &mut self.cache {
            // The token in the last position has no slot left to store into.
            if at >= slot.buffer.shape()[slot.seq_axis] {
                continue;
            }
            let entry = Self::output(&outputs, &slot.output)?;
            slot.buffer.copy_along_axis(slot.seq_axis, at, &entry, 0, 1)?;
        }
        self.cached += 1;
        trace!(cached = self.cached, "Generate step");
        self.outputs.insert("logits".to_string(), Self::output(&outputs, "logits")?);
        Ok(())
    }
}

impl InferRequest for ReferenceInferRequest {
    fn set_tensor(&mut self, name: &str, tensor: Tensor) -> Result<(), InferenceError> {
        self.inputs.insert(name.to_string(), tensor);
        Ok(())
    }

    fn get_tensor(&self, name: &str) -> Result<Tensor, InferenceError> {
        Self::output(&self.outputs, name)
    }

    fn input_mut(&mut self, name: &str) -> Result<&mut Tensor, InferenceError> {
        self.inputs
            .get_mut(name)
            .ok_or_else(|| InferenceError::TensorNotFound(name.to_string()))
    }

    fn infer(&mut self) -> Result<(), InferenceError> {
        let ids = self.input("input_ids")?.clone();
        if ids.shape().first().is_some_and(|&b| b != 1) {
            return Err(InferenceError::Precondition(format!(
                "only batch size 1 is supported, got input_ids {:?}",
                ids.shape()
            )));
        }
        let first_position = self
            .input("position_ids")?
            .to_i64_vec()
            .first()
            .copied()
            .unwrap_or(0);
        if ids.n_elements() > 1 || first_position == 0 {
            self.prefill(&ids)
        } else {
            self.decode(&ids)
        }
    }
}
