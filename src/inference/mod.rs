//! LLM inference
//!
//! The streaming bridge, its stopping check, the caller-facing evaluation API,
//! and the llama-cpp backed model collaborator.

pub mod engine;
pub mod generator;
pub mod model;
pub mod service;
pub mod stopping;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use engine::{AdapterInfo, LlamaEngine, LoadedModelInfo};
pub use model::{validate_gguf, GgufHeader, ModelError, GGUF_MAGIC};
pub use generator::{Generate, GenerationError, StepControl};
pub use service::{AnswerStream, InferenceService};
pub use stopping::{StoppingSignal, TokenId};
pub use streaming::{BridgeState, StreamItem, StreamProtocolError, StreamingBridge};
