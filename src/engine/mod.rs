//! Generation over a compiled static LLM.
//!
//! - [`sampler`]: generation config, per-sequence state, logit sampling
//! - [`streamer`]: token and text streaming callbacks
//! - [`generate`]: the prefill + decode loop

pub mod generate;
pub mod sampler;
pub mod streamer;

pub use generate::{EncodedInputs, EncodedResults, GenerationEngine, GenerationStatus, PerfMetrics};
pub use sampler::{GenerationConfig, LogitSampler, Sampler, SamplingConfig, TokenId};
pub use streamer::{NoopStreamer, Streamer, StreamingStatus, TextStreamer, TokenCallbackStreamer};
