//! Typed device options with the device-namespaced key table.
//!
//! Every field maps to one property key. Keys with no typed field are kept in
//! `extra` and passed through verbatim. Values are only rendered to strings at the
//! compiler boundary ([`DeviceOptions::to_properties`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InferenceError;

/// A value that can be parsed from a run-time option and rendered back.
pub trait OptionValue: Sized {
    fn parse(key: &str, value: &Value) -> Result<Self, InferenceError>;
    fn render(&self) -> String;
}

impl OptionValue for bool {
    fn parse(key: &str, value: &Value) -> Result<Self, InferenceError> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::String(s) => match s.as_str() {
                "YES" | "true" | "TRUE" | "1" => Ok(true),
                "NO" | "false" | "FALSE" | "0" => Ok(false),
                other => Err(InferenceError::Config(format!(
                    "{} expects YES or NO, got '{}'",
                    key, other
                ))),
            },
            other => Err(InferenceError::Config(format!(
                "{} expects YES or NO, got {}",
                key, other
            ))),
        }
    }

    fn render(&self) -> String {
        if *self { "YES" } else { "NO" }.to_string()
    }
}

impl OptionValue for i64 {
    fn parse(key: &str, value: &Value) -> Result<Self, InferenceError> {
        let parsed = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| InferenceError::Config(format!("{} expects an integer, got {}", key, value)))
    }

    fn render(&self) -> String {
        self.to_string()
    }
}

impl OptionValue for String {
    fn parse(_key: &str, value: &Value) -> Result<Self, InferenceError> {
        Ok(render_json(value))
    }

    fn render(&self) -> String {
        self.clone()
    }
}

/// Plain-string form of a JSON option value (strings without quotes).
pub fn render_json(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

macro_rules! device_options {
    ($( $(#[$doc:meta])* $field:ident : $ty:ty => $key:literal ),* $(,)?) => {
        /// Device compilation options. `None` means "not set".
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct DeviceOptions {
            $( $(#[$doc])* pub $field: Option<$ty>, )*
            /// Keys without a typed field.
            pub extra: BTreeMap<String, String>,
        }

        impl DeviceOptions {
            /// Property keys with a typed field.
            pub const KEYS: &'static [&'static str] = &[$($key),*];

            /// Overlay `other` onto `self`; every option set in `other` wins.
            pub fn merge(&mut self, other: &DeviceOptions) {
                $(
                    if let Some(v) = &other.$field {
                        self.$field = Some(v.clone());
                    }
                )*
                for (k, v) in &other.extra {
                    self.extra.insert(k.clone(), v.clone());
                }
            }

            /// Set one option from its property key.
            pub fn set(&mut self, key: &str, value: &Value) -> Result<(), InferenceError> {
                match key {
                    $( $key => self.$field = Some(<$ty as OptionValue>::parse(key, value)?), )*
                    _ => {
                        self.extra.insert(key.to_string(), render_json(value));
                    }
                }
                Ok(())
            }

            /// Whether `key` is set, typed or not.
            pub fn contains(&self, key: &str) -> bool {
                match key {
                    $( $key => self.$field.is_some(), )*
                    _ => self.extra.contains_key(key),
                }
            }

            /// Render every set option as `key → value` strings.
            pub fn to_properties(&self) -> BTreeMap<String, String> {
                let mut props = self.extra.clone();
                $(
                    if let Some(v) = &self.$field {
                        props.insert($key.to_string(), v.render());
                    }
                )*
                props
            }
        }
    };
}

device_options! {
    compilation_mode_params: String => "NPU_COMPILATION_MODE_PARAMS",
    devices: String => "NPUW_DEVICES",
    use_npuw: bool => "NPU_USE_NPUW",
    fold: bool => "NPUW_FOLD",
    /// Decompression offload element type.
    dcoff_type: String => "NPUW_DCOFF_TYPE",
    dcoff_scale: bool => "NPUW_DCOFF_SCALE",
    weights_bank: String => "NPUW_WEIGHTS_BANK",
    weights_bank_alloc: String => "NPUW_WEIGHTS_BANK_ALLOC",
    /// Only the last row of logits is produced.
    slice_out: bool => "NPUW_SLICE_OUT",
    funcall_async: bool => "NPUW_FUNCALL_ASYNC",
    funcall_for_all: bool => "NPUW_FUNCALL_FOR_ALL",
    dq: bool => "NPUW_DQ",
    dq_full: bool => "NPUW_DQ_FULL",
    compiler_dq: bool => "NPU_COMPILER_DYNAMIC_QUANTIZATION",
    pmm: bool => "NPUW_PMM",
    dpu_groups: i64 => "NPU_DPU_GROUPS",
    online_pipeline: String => "NPUW_ONLINE_PIPELINE",
    unfold_ireqs: bool => "NPUW_UNFOLD_IREQS",
    cache_dir: String => "NPUW_CACHE_DIR",
}

impl DeviceOptions {
    /// Build from a JSON object of property keys.
    pub fn from_json(value: &Value) -> Result<Self, InferenceError> {
        let Value::Object(map) = value else {
            return Err(InferenceError::Config(format!(
                "expected a map of device options, got {}",
                value
            )));
        };
        let mut options = DeviceOptions::default();
        for (k, v) in map {
            options.set(k, v)?;
        }
        Ok(options)
    }

    /// Copy of `self` with `other` overlaid.
    pub fn merged(&self, other: &DeviceOptions) -> DeviceOptions {
        let mut out = self.clone();
        out.merge(other);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_typed_and_passthrough() {
        let mut opts = DeviceOptions::default();
        opts.set("NPUW_FOLD", &json!("YES")).unwrap();
        opts.set("NPU_DPU_GROUPS", &json!(4)).unwrap();
        opts.set("PERFORMANCE_HINT", &json!("LATENCY")).unwrap();
        assert_eq!(opts.fold, Some(true));
        assert_eq!(opts.dpu_groups, Some(4));
        assert_eq!(opts.extra.get("PERFORMANCE_HINT").map(String::as_str), Some("LATENCY"));
        assert!(opts.contains("NPUW_FOLD"));
        assert!(!opts.contains("NPUW_DQ"));
    }

    #[test]
    fn test_bad_bool_rejected() {
        let mut opts = DeviceOptions::default();
        let err = opts.set("NPUW_DQ", &json!("MAYBE")).unwrap_err();
        assert!(err.to_string().contains("NPUW_DQ"));
    }

    #[test]
    fn test_bad_integer_rejected() {
        let mut opts = DeviceOptions::default();
        assert!(opts.set("NPU_DPU_GROUPS", &json!("four")).is_err());
        assert!(opts.set("NPU_DPU_GROUPS", &json!(2.5)).is_err());
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let mut base = DeviceOptions {
            dq: Some(false),
            fold: Some(true),
            ..Default::default()
        };
        let over = DeviceOptions {
            dq: Some(true),
            ..Default::default()
        };
        base.merge(&over);
        assert_eq!(base.dq, Some(true));
        assert_eq!(base.fold, Some(true), "unset options in the overlay keep the base value");
    }

    #[test]
    fn test_render_properties() {
        let opts = DeviceOptions {
            slice_out: Some(true),
            dq_full: Some(false),
            dpu_groups: Some(2),
            ..Default::default()
        };
        let props = opts.to_properties();
        assert_eq!(props["NPUW_SLICE_OUT"], "YES");
        assert_eq!(props["NPUW_DQ_FULL"], "NO");
        assert_eq!(props["NPU_DPU_GROUPS"], "2");
        assert_eq!(props.len(), 3);
    }

    #[test]
    fn test_from_json_requires_object() {
        assert!(DeviceOptions::from_json(&json!("NPUW_DQ")).is_err());
        let opts = DeviceOptions::from_json(&json!({"NPUW_ONLINE_PIPELINE": "NONE"})).unwrap();
        assert_eq!(opts.online_pipeline.as_deref(), Some("NONE"));
    }
}
