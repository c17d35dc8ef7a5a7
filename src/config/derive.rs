//! Layered device configuration: baseline → common → phase-specific.
//!
//! Each layer starts from the previous one and later rules override earlier ones.
//! All functions are pure; the environment is read once in
//! [`WeightsPlacement::from_env`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CacheMode, DeviceOptions, GenerateHint, HardwareDescriptor, PipelineOptions};
use crate::error::InferenceError;
use crate::graph::ComputeGraph;
use crate::shaping::KvAxesPosition;

/// Graph metadata key carrying the weight-compression group size.
pub const GROUP_SIZE_RT_INFO: &str = "nncf.weight_compression.group_size";

/// Setting this to `1` keeps the weights bank in CPU memory.
pub const DISABLE_L0_ENV: &str = "STRATA_DISABLE_NPU_L0";

const HIGHER_PRECISION_LAYERS: &str =
    "compute-layers-with-higher-precision=Sqrt,Power,ReduceMean,Add_RMSNorm";

/// Where shared weights live at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightsPlacement {
    #[default]
    FunctionCallsForAll,
    CpuBank,
}

impl WeightsPlacement {
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(DISABLE_L0_ENV).ok().as_deref())
    }

    /// Placement for a raw `STRATA_DISABLE_NPU_L0` value; `"1"` selects the CPU bank.
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.and_then(|v| v.trim().parse::<i32>().ok()) {
            Some(1) => WeightsPlacement::CpuBank,
            _ => WeightsPlacement::FunctionCallsForAll,
        }
    }
}

/// Weight-compression metadata of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelQuantization {
    /// `None` when the model was not compressed.
    pub group_size: Option<i64>,
}

impl ModelQuantization {
    pub fn from_graph(graph: &ComputeGraph) -> Self {
        let group_size = graph
            .rt_info(GROUP_SIZE_RT_INFO)
            .and_then(|v| v.trim().parse::<i64>().ok());
        Self { group_size }
    }

    /// Channel-wise compression is recorded as group size `-1`.
    pub fn is_channel_wise(&self) -> bool {
        self.group_size == Some(-1)
    }
}

fn has_compiler_dq(hw: Option<&HardwareDescriptor>) -> bool {
    hw.is_some_and(|h| h.compiler_dq)
}

pub fn baseline_config(hw: Option<&HardwareDescriptor>) -> DeviceOptions {
    let mut config = DeviceOptions {
        compilation_mode_params: Some(HIGHER_PRECISION_LAYERS.to_string()),
        devices: Some("NPU".to_string()),
        use_npuw: Some(true),
        fold: Some(true),
        dcoff_type: Some("f16".to_string()),
        dcoff_scale: Some(true),
        weights_bank: Some("shared".to_string()),
        slice_out: Some(true),
        funcall_async: Some(true),
        ..Default::default()
    };
    if has_compiler_dq(hw) {
        config.dq = Some(true);
        config.dq_full = Some(false);
        config.compiler_dq = Some(true);
        config.dcoff_type = None;
        config.dcoff_scale = None;
    }
    config
}

pub fn common_config(hw: Option<&HardwareDescriptor>, placement: WeightsPlacement) -> DeviceOptions {
    let mut config = baseline_config(hw);
    match placement {
        WeightsPlacement::CpuBank => config.weights_bank_alloc = Some("CPU".to_string()),
        WeightsPlacement::FunctionCallsForAll => config.funcall_for_all = Some(true),
    }
    config
}

pub fn prefill_config(
    hw: Option<&HardwareDescriptor>,
    quant: &ModelQuantization,
    placement: WeightsPlacement,
) -> DeviceOptions {
    let mut config = common_config(hw, placement);
    if let Some(h) = hw {
        if h.arch == "4000" && h.max_tiles != -1 {
            config.dpu_groups = Some(h.max_tiles);
        }
    }
    if !has_compiler_dq(hw) {
        if quant.is_channel_wise() {
            config.dq = Some(true);
        } else {
            config.pmm = Some(false);
        }
    }
    config
}

pub fn generate_config(
    hw: Option<&HardwareDescriptor>,
    hint: GenerateHint,
    placement: WeightsPlacement,
) -> DeviceOptions {
    let mut config = common_config(hw, placement);
    if hint == GenerateHint::BestPerf {
        config.online_pipeline = Some("NONE".to_string());
    }
    if hw.is_some_and(|h| h.arch == "4000") {
        config.dpu_groups = Some(4);
    }
    if hint == GenerateHint::FastCompile {
        config.unfold_ireqs = Some(true);
    }
    if !has_compiler_dq(hw) {
        config.dq = Some(true);
    }
    config
}

/// Options of the static LLM mode itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmOptions {
    pub enabled: bool,
    pub batch_dim: usize,
    pub seq_len_dim: usize,
    pub max_prompt_len: usize,
    pub min_response_len: usize,
    pub generate_hint: GenerateHint,
}

impl LlmOptions {
    pub fn kvcache_total(&self) -> usize {
        self.max_prompt_len + self.min_response_len
    }

    pub fn axes(&self) -> KvAxesPosition {
        KvAxesPosition {
            batch: self.batch_dim,
            seq_len: self.seq_len_dim,
        }
    }

    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let yes_no = if self.enabled { "YES" } else { "NO" };
        BTreeMap::from([
            ("NPUW_LLM".to_string(), yes_no.to_string()),
            ("NPUW_LLM_BATCH_DIM".to_string(), self.batch_dim.to_string()),
            ("NPUW_LLM_SEQ_LEN_DIM".to_string(), self.seq_len_dim.to_string()),
            ("NPUW_LLM_MAX_PROMPT_LEN".to_string(), self.max_prompt_len.to_string()),
            ("NPUW_LLM_MIN_RESPONSE_LEN".to_string(), self.min_response_len.to_string()),
            ("NPUW_LLM_GENERATE_HINT".to_string(), self.generate_hint.as_str().to_string()),
        ])
    }
}

/// Fully resolved configuration handed to the device compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub llm: LlmOptions,
    pub common: DeviceOptions,
    pub prefill: DeviceOptions,
    pub generate: DeviceOptions,
    pub cache_mode: Option<CacheMode>,
}

impl PipelineConfig {
    /// Flat device-namespaced property map.
    pub fn to_properties(&self) -> Result<BTreeMap<String, String>, InferenceError> {
        let mut props = self.common.to_properties();
        props.extend(self.llm.to_properties());
        props.insert(
            "NPUW_LLM_PREFILL_CONFIG".to_string(),
            serde_json::to_string(&self.prefill.to_properties())?,
        );
        props.insert(
            "NPUW_LLM_GENERATE_CONFIG".to_string(),
            serde_json::to_string(&self.generate.to_properties())?,
        );
        Ok(props)
    }
}

/// Resolve user options against hardware and model metadata.
///
/// Phase defaults come from [`prefill_config`] / [`generate_config`] unless the
/// user replaced them; common passthrough options and then the `++` extensions are
/// merged on top.
pub fn derive_pipeline_config(
    options: &PipelineOptions,
    hw: Option<&HardwareDescriptor>,
    quant: &ModelQuantization,
    axes: KvAxesPosition,
    placement: WeightsPlacement,
) -> Result<PipelineConfig, InferenceError> {
    if options.generate.replace.is_some() && options.generate_hint.is_some() {
        return Err(InferenceError::Config(
            "GENERATE_HINT is only applicable to the default generate config".to_string(),
        ));
    }
    let hint = options.generate_hint_or_default();

    let mut common = options.device.clone();
    if common.use_npuw.is_none() {
        common.use_npuw = Some(true);
    }
    if let Some(dir) = &options.cache_dir {
        let dir = dir.to_string_lossy().into_owned();
        if common.use_npuw == Some(true) {
            common.cache_dir = Some(dir);
        } else {
            common.extra.insert("CACHE_DIR".to_string(), dir);
        }
    }

    let prefill_base = match &options.prefill.replace {
        Some(replaced) => replaced.clone(),
        None => prefill_config(hw, quant, placement),
    };
    let generate_base = match &options.generate.replace {
        Some(replaced) => replaced.clone(),
        None => generate_config(hw, hint, placement),
    };
    let prefill = prefill_base
        .merged(&options.device)
        .merged(&options.prefill.extend);
    let generate = generate_base
        .merged(&options.device)
        .merged(&options.generate.extend);

    let llm = LlmOptions {
        enabled: true,
        batch_dim: axes.batch,
        seq_len_dim: axes.seq_len,
        max_prompt_len: options.max_prompt_len,
        min_response_len: options.min_response_len,
        generate_hint: hint,
    };
    debug!(
        max_prompt_len = llm.max_prompt_len,
        min_response_len = llm.min_response_len,
        hint = hint.as_str(),
        "Derived pipeline config"
    );
    Ok(PipelineConfig {
        llm,
        common,
        prefill,
        generate,
        cache_mode: options.cache_mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn npu(arch: &str, max_tiles: i64, compiler_dq: bool) -> HardwareDescriptor {
        HardwareDescriptor {
            arch: arch.to_string(),
            max_tiles,
            compiler_dq,
        }
    }

    const CW: ModelQuantization = ModelQuantization { group_size: Some(-1) };
    const GROUPED: ModelQuantization = ModelQuantization { group_size: Some(128) };

    #[test]
    fn test_baseline_without_compiler_dq() {
        let cfg = baseline_config(None);
        assert_eq!(cfg.dcoff_type.as_deref(), Some("f16"));
        assert_eq!(cfg.dcoff_scale, Some(true));
        assert_eq!(cfg.slice_out, Some(true));
        assert_eq!(cfg.dq, None);
    }

    #[test]
    fn test_baseline_with_compiler_dq() {
        let hw = npu("3720", 2, true);
        let cfg = baseline_config(Some(&hw));
        assert_eq!(cfg.dq, Some(true));
        assert_eq!(cfg.dq_full, Some(false));
        assert_eq!(cfg.compiler_dq, Some(true));
        assert_eq!(cfg.dcoff_type, None);
        assert_eq!(cfg.dcoff_scale, None);
    }

    #[test]
    fn test_common_weights_placement() {
        let cpu = common_config(None, WeightsPlacement::CpuBank);
        assert_eq!(cpu.weights_bank_alloc.as_deref(), Some("CPU"));
        assert_eq!(cpu.funcall_for_all, None);
        let funcall = common_config(None, WeightsPlacement::FunctionCallsForAll);
        assert_eq!(funcall.funcall_for_all, Some(true));
        assert_eq!(funcall.weights_bank_alloc, None);
    }

    #[test]
    fn test_weights_placement_from_env_value() {
        assert_eq!(WeightsPlacement::from_env_value(Some("1")), WeightsPlacement::CpuBank);
        assert_eq!(WeightsPlacement::from_env_value(Some(" 1 ")), WeightsPlacement::CpuBank);
        assert_eq!(
            WeightsPlacement::from_env_value(Some("0")),
            WeightsPlacement::FunctionCallsForAll
        );
        assert_eq!(
            WeightsPlacement::from_env_value(Some("yes")),
            WeightsPlacement::FunctionCallsForAll
        );
        assert_eq!(WeightsPlacement::from_env_value(None), WeightsPlacement::FunctionCallsForAll);
    }

    #[test]
    fn test_prefill_rules() {
        let hw = npu("4000", 6, false);
        let cfg = prefill_config(Some(&hw), &CW, WeightsPlacement::default());
        assert_eq!(cfg.dpu_groups, Some(6));
        assert_eq!(cfg.dq, Some(true));
        assert_eq!(cfg.pmm, None);

        let cfg = prefill_config(Some(&npu("4000", -1, false)), &GROUPED, WeightsPlacement::default());
        assert_eq!(cfg.dpu_groups, None, "unknown tile count");
        assert_eq!(cfg.pmm, Some(false));
        assert_eq!(cfg.dq, None);

        let cfg = prefill_config(Some(&npu("3720", 2, true)), &GROUPED, WeightsPlacement::default());
        assert_eq!(cfg.dpu_groups, None);
        assert_eq!(cfg.pmm, None, "compiler DQ skips the NPUW DQ rules");
        assert_eq!(cfg.dq, Some(true));
    }

    #[test]
    fn test_prefill_uncompressed_model_disables_pmm() {
        let cfg = prefill_config(None, &ModelQuantization::default(), WeightsPlacement::default());
        assert_eq!(cfg.pmm, Some(false));
    }

    #[test]
    fn test_generate_rules() {
        let hw = npu("4000", 6, false);
        let fast = generate_config(Some(&hw), GenerateHint::FastCompile, WeightsPlacement::default());
        assert_eq!(fast.dpu_groups, Some(4));
        assert_eq!(fast.unfold_ireqs, Some(true));
        assert_eq!(fast.online_pipeline, None);
        assert_eq!(fast.dq, Some(true));

        let best = generate_config(None, GenerateHint::BestPerf, WeightsPlacement::default());
        assert_eq!(best.online_pipeline.as_deref(), Some("NONE"));
        assert_eq!(best.unfold_ireqs, None);
        assert_eq!(best.dpu_groups, None);
    }

    #[test]
    fn test_quantization_from_rt_info() {
        let mut g = ComputeGraph::new();
        assert_eq!(ModelQuantization::from_graph(&g).group_size, None);
        g.set_rt_info(GROUP_SIZE_RT_INFO, "-1");
        assert!(ModelQuantization::from_graph(&g).is_channel_wise());
    }

    fn derive(map: &[(&str, serde_json::Value)], hw: Option<&HardwareDescriptor>) -> Result<PipelineConfig, InferenceError> {
        let map: BTreeMap<String, serde_json::Value> =
            map.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let options = PipelineOptions::from_map(&map)?;
        derive_pipeline_config(&options, hw, &GROUPED, KvAxesPosition::default(), WeightsPlacement::default())
    }

    #[test]
    fn test_derivation_is_idempotent() {
        let hw = npu("4000", 4, false);
        let opts = [("MAX_PROMPT_LEN", json!(512)), ("++PREFILL_CONFIG", json!({"NPUW_FOLD": "NO"}))];
        let a = derive(&opts, Some(&hw)).unwrap();
        let b = derive(&opts, Some(&hw)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_properties().unwrap(), b.to_properties().unwrap());
    }

    #[test]
    fn test_user_overrides() {
        let cfg = derive(
            &[
                ("PREFILL_CONFIG", json!({"NPUW_DEVICES": "CPU"})),
                ("++GENERATE_CONFIG", json!({"NPUW_DQ": "NO"})),
                ("PERFORMANCE_HINT", json!("LATENCY")),
            ],
            None,
        )
        .unwrap();
        assert_eq!(cfg.prefill.devices.as_deref(), Some("CPU"));
        assert_eq!(cfg.prefill.fold, None, "replaced config drops derived defaults");
        assert_eq!(cfg.prefill.extra["PERFORMANCE_HINT"], "LATENCY");
        assert_eq!(cfg.generate.dq, Some(false), "extension wins over the derived value");
        assert_eq!(cfg.generate.fold, Some(true));
    }

    #[test]
    fn test_hint_with_replaced_generate_config_rejected() {
        let result = derive(
            &[
                ("GENERATE_CONFIG", json!({})),
                ("GENERATE_HINT", json!("BEST_PERF")),
            ],
            None,
        );
        assert!(matches!(result, Err(InferenceError::Config(_))));
    }

    #[test]
    fn test_cache_dir_renamed_for_npuw() {
        let cfg = derive(&[("CACHE_DIR", json!("/tmp/cache"))], None).unwrap();
        let props = cfg.to_properties().unwrap();
        assert_eq!(props["NPUW_CACHE_DIR"], "/tmp/cache");
        assert!(!props.contains_key("CACHE_DIR"));

        let cfg = derive(&[("CACHE_DIR", json!("/tmp/cache")), ("NPU_USE_NPUW", json!("NO"))], None).unwrap();
        let props = cfg.to_properties().unwrap();
        assert_eq!(props["CACHE_DIR"], "/tmp/cache");
        assert!(!props.contains_key("NPUW_CACHE_DIR"));
    }

    #[test]
    fn test_rendered_llm_keys() {
        let cfg = derive(&[("GENERATE_HINT", json!("BEST_PERF"))], None).unwrap();
        let props = cfg.to_properties().unwrap();
        assert_eq!(props["NPUW_LLM"], "YES");
        assert_eq!(props["NPU_USE_NPUW"], "YES");
        assert_eq!(props["NPUW_LLM_MAX_PROMPT_LEN"], "1024");
        assert_eq!(props["NPUW_LLM_MIN_RESPONSE_LEN"], "128");
        assert_eq!(props["NPUW_LLM_SEQ_LEN_DIM"], "2");
        assert_eq!(props["NPUW_LLM_GENERATE_HINT"], "BEST_PERF");
        let generate: BTreeMap<String, String> =
            serde_json::from_str(&props["NPUW_LLM_GENERATE_CONFIG"]).unwrap();
        assert_eq!(generate["NPUW_ONLINE_PIPELINE"], "NONE");
        assert!(!props.contains_key("GENERATE_HINT"));
    }
}
