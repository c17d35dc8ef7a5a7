//! Device engine abstraction.
//!
//! A [`DeviceEngine`] compiles a [`ComputeGraph`] under a [`PipelineConfig`] into a
//! [`CompiledArtifact`], from which stateful [`InferRequest`]s are created. The
//! process keeps one engine handle, created lazily by [`engine`] and released by
//! [`shutdown`].

pub mod reference;

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::config::{HardwareDescriptor, PipelineConfig};
use crate::error::InferenceError;
use crate::graph::ComputeGraph;
use crate::tensor::Tensor;

/// Compiler and runtime for one family of devices.
pub trait DeviceEngine: Send + Sync {
    /// Short engine name used in logs.
    fn name(&self) -> &str;

    fn available_devices(&self) -> Vec<String>;

    /// Capabilities of `device`, or `None` when it cannot be queried.
    fn hardware_descriptor(&self, device: &str) -> Option<HardwareDescriptor>;

    fn compile(
        &self,
        graph: &ComputeGraph,
        device: &str,
        config: &PipelineConfig,
    ) -> Result<CompiledArtifact, InferenceError>;

    /// Load a previously exported artifact.
    fn import(
        &self,
        reader: &mut dyn Read,
        device: &str,
        config: &PipelineConfig,
    ) -> Result<CompiledArtifact, InferenceError>;
}

/// Device-side program behind a [`CompiledArtifact`].
pub trait Executable: Send + Sync {
    fn create_infer_request(&self) -> Result<Box<dyn InferRequest>, InferenceError>;

    fn export(&self, writer: &mut dyn Write) -> Result<(), InferenceError>;
}

/// One stateful inference context. The device may keep state (the KV cache)
/// between [`infer`](InferRequest::infer) calls.
pub trait InferRequest: Send {
    fn set_tensor(&mut self, name: &str, tensor: Tensor) -> Result<(), InferenceError>;

    fn get_tensor(&self, name: &str) -> Result<Tensor, InferenceError>;

    /// Bound input `name`, updated in place between infer calls.
    fn input_mut(&mut self, name: &str) -> Result<&mut Tensor, InferenceError>;

    fn infer(&mut self) -> Result<(), InferenceError>;
}

/// A compiled model together with the capacities it was compiled for.
#[derive(Clone)]
pub struct CompiledArtifact {
    device: String,
    max_prompt_len: usize,
    min_response_len: usize,
    executable: Arc<dyn Executable>,
}

impl std::fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("device", &self.device)
            .field("max_prompt_len", &self.max_prompt_len)
            .field("min_response_len", &self.min_response_len)
            .finish_non_exhaustive()
    }
}

impl CompiledArtifact {
    pub fn new(
        device: &str,
        max_prompt_len: usize,
        min_response_len: usize,
        executable: Arc<dyn Executable>,
    ) -> Self {
        Self {
            device: device.to_string(),
            max_prompt_len,
            min_response_len,
            executable,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn max_prompt_len(&self) -> usize {
        self.max_prompt_len
    }

    pub fn min_response_len(&self) -> usize {
        self.min_response_len
    }

    /// Total KV cache capacity in positions.
    pub fn kvcache_total(&self) -> usize {
        self.max_prompt_len + self.min_response_len
    }

    pub fn create_infer_request(&self) -> Result<Box<dyn InferRequest>, InferenceError> {
        self.executable.create_infer_request()
    }

    pub fn export(&self, writer: &mut dyn Write) -> Result<(), InferenceError> {
        self.executable.export(writer)
    }
}

static ENGINE: Mutex<Option<Arc<dyn DeviceEngine>>> = Mutex::new(None);

/// The process-wide engine, created on first use.
pub fn engine() -> Arc<dyn DeviceEngine> {
    let mut slot = ENGINE.lock().unwrap_or_else(PoisonError::into_inner);
    slot.get_or_insert_with(|| {
        info!("Initialized reference device engine");
        Arc::new(reference::ReferenceEngine::new()) as Arc<dyn DeviceEngine>
    })
    .clone()
}

/// Replace the process-wide engine, returning the previous one.
pub fn install_engine(engine: Arc<dyn DeviceEngine>) -> Option<Arc<dyn DeviceEngine>> {
    let mut slot = ENGINE.lock().unwrap_or_else(PoisonError::into_inner);
    info!(engine = engine.name(), "Installed device engine");
    slot.replace(engine)
}

/// Drop the process-wide engine. Artifacts already compiled keep working.
pub fn shutdown() {
    let mut slot = ENGINE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(engine) = slot.take() {
        info!(engine = engine.name(), "Device engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedEngine(&'static str);

    impl DeviceEngine for NamedEngine {
        fn name(&self) -> &str {
            self.0
        }

        fn available_devices(&self) -> Vec<String> {
            Vec::new()
        }

        fn hardware_descriptor(&self, _device: &str) -> Option<HardwareDescriptor> {
            None
        }

        fn compile(
            &self,
            _graph: &ComputeGraph,
            _device: &str,
            _config: &PipelineConfig,
        ) -> Result<CompiledArtifact, InferenceError> {
            Err(InferenceError::Backend("not supported".into()))
        }

        fn import(
            &self,
            _reader: &mut dyn Read,
            _device: &str,
            _config: &PipelineConfig,
        ) -> Result<CompiledArtifact, InferenceError> {
            Err(InferenceError::Backend("not supported".into()))
        }
    }

    // Single test so the global handle is never touched concurrently.
    #[test]
    fn test_global_engine_lifecycle() {
        shutdown();
        assert_eq!(engine().name(), "reference", "lazy default is the reference engine");

        let previous = install_engine(Arc::new(NamedEngine("fake")));
        assert_eq!(previous.map(|e| e.name().to_string()).as_deref(), Some("reference"));
        assert_eq!(engine().name(), "fake");

        shutdown();
        assert_eq!(engine().name(), "reference", "shutdown resets to lazy init");
        shutdown();
    }
}
