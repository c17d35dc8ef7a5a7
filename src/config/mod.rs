//! Pipeline configuration.
//!
//! - [`PipelineOptions`]: the user-facing option map, parsed into typed fields
//! - [`DeviceOptions`]: typed device compilation options
//! - [`derive`]: hardware + quantization metadata → layered [`PipelineConfig`]

pub mod derive;
pub mod device;
pub mod hardware;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InferenceError;

pub use derive::{
    derive_pipeline_config, LlmOptions, ModelQuantization, PipelineConfig, WeightsPlacement,
};
pub use device::DeviceOptions;
pub use hardware::HardwareDescriptor;

pub const DEFAULT_MAX_PROMPT_LEN: usize = 1024;
pub const DEFAULT_MIN_RESPONSE_LEN: usize = 128;

/// Generate-phase compilation preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GenerateHint {
    #[default]
    FastCompile,
    BestPerf,
}

impl GenerateHint {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerateHint::FastCompile => "FAST_COMPILE",
            GenerateHint::BestPerf => "BEST_PERF",
        }
    }
}

impl std::str::FromStr for GenerateHint {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FAST_COMPILE" => Ok(GenerateHint::FastCompile),
            "BEST_PERF" => Ok(GenerateHint::BestPerf),
            other => Err(InferenceError::Config(format!(
                "Unsupported GENERATE_HINT provided: {}. Please select FAST_COMPILE or BEST_PERF",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    OptimizeSpeed,
    OptimizeSize,
}

impl std::str::FromStr for CacheMode {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPTIMIZE_SPEED" => Ok(CacheMode::OptimizeSpeed),
            "OPTIMIZE_SIZE" => Ok(CacheMode::OptimizeSize),
            other => Err(InferenceError::Config(format!("Unsupported CACHE_MODE: {}", other))),
        }
    }
}

/// Static pipeline flavour. Only the stateful one is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineKind {
    #[default]
    Stateful,
}

impl std::str::FromStr for PipelineKind {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STATEFUL" => Ok(PipelineKind::Stateful),
            other => Err(InferenceError::Config(format!(
                "Unsupported STATIC_PIPELINE provided: {}. Please select STATEFUL",
                other
            ))),
        }
    }
}

/// User-supplied phase override: replaces the derived defaults, or extends them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOverride {
    /// `PREFILL_CONFIG` / `GENERATE_CONFIG`.
    pub replace: Option<DeviceOptions>,
    /// `++PREFILL_CONFIG` / `++GENERATE_CONFIG`.
    pub extend: DeviceOptions,
}

/// Typed view of the pipeline option map.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub max_prompt_len: usize,
    pub min_response_len: usize,
    /// `None` when the user did not set `GENERATE_HINT`.
    pub generate_hint: Option<GenerateHint>,
    pub blob_path: Option<PathBuf>,
    pub export_blob: bool,
    pub cache_mode: Option<CacheMode>,
    pub cache_dir: Option<PathBuf>,
    pub pipeline: PipelineKind,
    pub prefill: PhaseOverride,
    pub generate: PhaseOverride,
    /// Every other key, passed to the device as a common option.
    pub device: DeviceOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_prompt_len: DEFAULT_MAX_PROMPT_LEN,
            min_response_len: DEFAULT_MIN_RESPONSE_LEN,
            generate_hint: None,
            blob_path: None,
            export_blob: false,
            cache_mode: None,
            cache_dir: None,
            pipeline: PipelineKind::default(),
            prefill: PhaseOverride::default(),
            generate: PhaseOverride::default(),
            device: DeviceOptions::default(),
        }
    }
}

fn parse_capacity(key: &str, value: &Value) -> Result<usize, InferenceError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v < 0 => Err(InferenceError::Config(format!("{} cannot be negative!", key))),
        Some(v) => Ok(v as usize),
        None => Err(InferenceError::Config(format!(
            "Failed to extract {}. Type mismatch: expected an integer, got {}",
            key, value
        ))),
    }
}

fn parse_string(key: &str, value: &Value) -> Result<String, InferenceError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(InferenceError::Config(format!("{} expects a string, got {}", key, other))),
    }
}

impl PipelineOptions {
    /// Parse an option map. Unknown keys become common device options.
    pub fn from_map(map: &BTreeMap<String, Value>) -> Result<Self, InferenceError> {
        let mut options = PipelineOptions::default();
        for (key, value) in map {
            match key.as_str() {
                "MAX_PROMPT_LEN" => options.max_prompt_len = parse_capacity(key, value)?,
                "MIN_RESPONSE_LEN" => options.min_response_len = parse_capacity(key, value)?,
                "GENERATE_HINT" => options.generate_hint = Some(parse_string(key, value)?.parse()?),
                "BLOB_PATH" => {
                    let path = parse_string(key, value)?;
                    if !path.is_empty() {
                        options.blob_path = Some(PathBuf::from(path));
                    }
                }
                "EXPORT_BLOB" => options.export_blob = <bool as device::OptionValue>::parse(key, value)?,
                "CACHE_MODE" => options.cache_mode = Some(parse_string(key, value)?.parse()?),
                "CACHE_DIR" => options.cache_dir = Some(PathBuf::from(parse_string(key, value)?)),
                "STATIC_PIPELINE" => options.pipeline = parse_string(key, value)?.parse()?,
                "PREFILL_CONFIG" => options.prefill.replace = Some(DeviceOptions::from_json(value)?),
                "++PREFILL_CONFIG" => options.prefill.extend = DeviceOptions::from_json(value)?,
                "GENERATE_CONFIG" => options.generate.replace = Some(DeviceOptions::from_json(value)?),
                "++GENERATE_CONFIG" => options.generate.extend = DeviceOptions::from_json(value)?,
                _ => options.device.set(key, value)?,
            }
        }
        Ok(options)
    }

    /// Prompt capacity plus guaranteed response room.
    pub fn kvcache_total(&self) -> usize {
        self.max_prompt_len + self.min_response_len
    }

    pub fn generate_hint_or_default(&self) -> GenerateHint {
        self.generate_hint.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_defaults() {
        let opts = PipelineOptions::from_map(&BTreeMap::new()).unwrap();
        assert_eq!(opts.max_prompt_len, 1024);
        assert_eq!(opts.min_response_len, 128);
        assert_eq!(opts.kvcache_total(), 1152);
        assert_eq!(opts.generate_hint_or_default(), GenerateHint::FastCompile);
        assert!(!opts.export_blob);
        assert_eq!(opts.pipeline, PipelineKind::Stateful);
    }

    #[test]
    fn test_parse_known_keys() {
        let opts = PipelineOptions::from_map(&map(&[
            ("MAX_PROMPT_LEN", json!(256)),
            ("MIN_RESPONSE_LEN", json!("64")),
            ("GENERATE_HINT", json!("BEST_PERF")),
            ("BLOB_PATH", json!("/tmp/model.blob")),
            ("EXPORT_BLOB", json!("YES")),
            ("CACHE_MODE", json!("OPTIMIZE_SIZE")),
            ("++GENERATE_CONFIG", json!({"NPUW_DQ": "NO"})),
            ("PERFORMANCE_HINT", json!("LATENCY")),
        ]))
        .unwrap();
        assert_eq!(opts.max_prompt_len, 256);
        assert_eq!(opts.min_response_len, 64);
        assert_eq!(opts.generate_hint, Some(GenerateHint::BestPerf));
        assert_eq!(opts.blob_path, Some(PathBuf::from("/tmp/model.blob")));
        assert!(opts.export_blob);
        assert_eq!(opts.cache_mode, Some(CacheMode::OptimizeSize));
        assert_eq!(opts.generate.extend.dq, Some(false));
        assert!(opts.generate.replace.is_none());
        assert_eq!(opts.device.extra["PERFORMANCE_HINT"], "LATENCY");
    }

    #[test]
    fn test_negative_capacity_rejected() {
        let err = PipelineOptions::from_map(&map(&[("MAX_PROMPT_LEN", json!(-1))])).unwrap_err();
        assert!(matches!(err, InferenceError::Config(_)));
        assert!(err.to_string().contains("cannot be negative"));
    }

    #[test]
    fn test_non_integer_capacity_rejected() {
        assert!(PipelineOptions::from_map(&map(&[("MIN_RESPONSE_LEN", json!("lots"))])).is_err());
        assert!(PipelineOptions::from_map(&map(&[("MIN_RESPONSE_LEN", json!(1.5))])).is_err());
    }

    #[test]
    fn test_unsupported_hint_and_pipeline() {
        assert!(PipelineOptions::from_map(&map(&[("GENERATE_HINT", json!("FASTEST"))])).is_err());
        assert!(PipelineOptions::from_map(&map(&[("STATIC_PIPELINE", json!("STATELESS"))])).is_err());
    }
}
