//! Accelerator capability detection.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::DeviceEngine;

/// Device name the static pipeline targets.
pub const NPU_DEVICE: &str = "NPU";

/// Capabilities of the target accelerator. Immutable after detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareDescriptor {
    /// Architecture id, e.g. `"3720"` or `"4000"`.
    pub arch: String,
    /// Max tile count; `-1` when unknown.
    pub max_tiles: i64,
    /// Whether the device compiler supports dynamic quantization itself.
    pub compiler_dq: bool,
}

impl HardwareDescriptor {
    /// Query the engine for the NPU descriptor.
    ///
    /// Returns `None` when no NPU is available. Never panics.
    pub fn detect(engine: &dyn DeviceEngine) -> Option<Self> {
        if !engine.available_devices().iter().any(|d| d == NPU_DEVICE) {
            debug!("No NPU device available");
            return None;
        }
        let desc = engine.hardware_descriptor(NPU_DEVICE);
        debug!(?desc, "Detected NPU descriptor");
        desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::reference::ReferenceEngine;

    #[test]
    fn test_detect_reference_npu() {
        let engine = ReferenceEngine::new();
        let desc = HardwareDescriptor::detect(&engine).unwrap();
        assert!(!desc.arch.is_empty());
    }

    #[test]
    fn test_detect_without_npu() {
        let engine = ReferenceEngine::new().with_devices(&["CPU"]);
        assert!(HardwareDescriptor::detect(&engine).is_none());
    }
}
