//! Blocking generation contract
//!
//! Anything that can run a token-by-token generation and report a cumulative
//! decoded snapshot after each token can be driven by a
//! [`StreamingBridge`](crate::inference::streaming::StreamingBridge).

use std::sync::Arc;

use thiserror::Error;

use crate::inference::model::ModelError;
use crate::inference::stopping::{StoppingSignal, TokenId};
use crate::types::GenerationRequest;

/// Errors raised by a generation call
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Backend not initialized")]
    BackendNotInitialized,

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to load adapter: {0}")]
    AdapterLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),

    #[error("Generation worker panicked: {0}")]
    WorkerPanicked(String),
}

impl From<ModelError> for GenerationError {
    fn from(e: ModelError) -> Self {
        GenerationError::ModelValidation(e.to_string())
    }
}

/// Returned by the step callback to tell the generation loop whether to go on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    Stop,
}

impl StepControl {
    pub fn is_stop(self) -> bool {
        self == StepControl::Stop
    }
}

/// A blocking, callback-instrumented generation call
///
/// Implementations must:
/// - call `on_step` at least once per generated token, passing the full
///   cumulative decoded text (not a delta);
/// - call it from the thread that invoked `generate`, never concurrently;
/// - stop within one token once `on_step` returns [`StepControl::Stop`] or
///   `signal.should_stop` reports true.
///
/// A model that is not thread-safe must serialize concurrent `generate`
/// calls itself; the bridge only owns the thread wrapping one invocation.
pub trait Generate: Send + Sync + 'static {
    /// End-of-sequence ids copied into every new [`StoppingSignal`]
    fn eos_token_ids(&self) -> Vec<TokenId>;

    fn generate(
        &self,
        request: &GenerationRequest,
        prompt: &str,
        on_step: &mut dyn FnMut(&str) -> StepControl,
        signal: &StoppingSignal,
    ) -> Result<(), GenerationError>;
}

impl<G: Generate> Generate for Arc<G> {
    fn eos_token_ids(&self) -> Vec<TokenId> {
        (**self).eos_token_ids()
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        prompt: &str,
        on_step: &mut dyn FnMut(&str) -> StepControl,
        signal: &StoppingSignal,
    ) -> Result<(), GenerationError> {
        (**self).generate(request, prompt, on_step, signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GenerationError::Inference("decode failed".to_string());
        assert_eq!(err.to_string(), "Inference failed: decode failed");
    }

    #[test]
    fn test_step_control() {
        assert!(StepControl::Stop.is_stop());
        assert!(!StepControl::Continue.is_stop());
    }
}
