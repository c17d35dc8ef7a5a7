pub mod error;
pub mod tensor;
pub mod graph;
pub mod rewrite;
pub mod shaping;
pub mod config;
pub mod backend;
pub mod model;
pub mod engine;
pub mod cli;

pub use error::InferenceError;
pub use graph::ComputeGraph;
pub use tensor::Tensor;
pub use config::PipelineOptions;
pub use backend::{CompiledArtifact, DeviceEngine, InferRequest};
pub use engine::{EncodedInputs, EncodedResults, GenerationConfig, GenerationEngine, GenerationStatus};
