//! Generation request types
//!
//! Sampling parameters for a single query, validated before any worker starts.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound accepted for `max_new_tokens`
pub const MAX_NEW_TOKENS_LIMIT: u32 = 2000;

/// Upper bound accepted for `num_beams`
pub const MAX_BEAMS: u32 = 4;

/// A malformed generation request
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    /// Name of the offending field
    pub field: &'static str,
    /// Human-readable reason
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Sampling parameters for one query
///
/// Fields are private so a request cannot change after it was validated.
/// Requests that arrive through serde are validated again when a stream is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    instruction: String,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_top_p")]
    top_p: f32,
    #[serde(default = "default_top_k")]
    top_k: u32,
    #[serde(default = "default_num_beams")]
    num_beams: u32,
    #[serde(default = "default_max_new_tokens")]
    max_new_tokens: u32,
    #[serde(default = "default_stream_output")]
    stream_output: bool,
    /// Fixed sampling seed; random when unset
    #[serde(default)]
    seed: Option<u32>,
}

fn default_temperature() -> f32 {
    0.1
}

fn default_top_p() -> f32 {
    0.75
}

fn default_top_k() -> u32 {
    40
}

fn default_num_beams() -> u32 {
    4
}

fn default_max_new_tokens() -> u32 {
    512
}

fn default_stream_output() -> bool {
    true
}

impl GenerationRequest {
    /// Create a request with default sampling parameters
    pub fn new(instruction: impl Into<String>) -> Result<Self, ValidationError> {
        Self::builder(instruction).build()
    }

    /// Start building a request for `instruction`
    pub fn builder(instruction: impl Into<String>) -> GenerationRequestBuilder {
        GenerationRequestBuilder {
            request: GenerationRequest {
                instruction: instruction.into(),
                temperature: default_temperature(),
                top_p: default_top_p(),
                top_k: default_top_k(),
                num_beams: default_num_beams(),
                max_new_tokens: default_max_new_tokens(),
                stream_output: default_stream_output(),
                seed: None,
            },
        }
    }

    /// Check every field, reporting the first one out of range
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.instruction.trim().is_empty() {
            return Err(ValidationError::new("instruction", "must not be empty"));
        }

        if !self.temperature.is_finite() || !(0.0..=1.0).contains(&self.temperature) {
            return Err(ValidationError::new(
                "temperature",
                format!("{} is outside [0, 1]", self.temperature),
            ));
        }

        if !self.top_p.is_finite() || !(0.0..=1.0).contains(&self.top_p) {
            return Err(ValidationError::new(
                "top_p",
                format!("{} is outside [0, 1]", self.top_p),
            ));
        }

        if !(1..=MAX_BEAMS).contains(&self.num_beams) {
            return Err(ValidationError::new(
                "num_beams",
                format!("{} is outside [1, {}]", self.num_beams, MAX_BEAMS),
            ));
        }

        if !(1..=MAX_NEW_TOKENS_LIMIT).contains(&self.max_new_tokens) {
            return Err(ValidationError::new(
                "max_new_tokens",
                format!("{} is outside [1, {}]", self.max_new_tokens, MAX_NEW_TOKENS_LIMIT),
            ));
        }

        Ok(())
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    /// Top-k sampling parameter (0 = disabled)
    pub fn top_k(&self) -> u32 {
        self.top_k
    }

    pub fn num_beams(&self) -> u32 {
        self.num_beams
    }

    pub fn max_new_tokens(&self) -> u32 {
        self.max_new_tokens
    }

    /// Whether the caller wants every intermediate snapshot or only the final answer
    pub fn stream_output(&self) -> bool {
        self.stream_output
    }

    pub fn seed(&self) -> Option<u32> {
        self.seed
    }
}

/// Builder for [`GenerationRequest`]
#[derive(Debug, Clone)]
pub struct GenerationRequestBuilder {
    request: GenerationRequest,
}

impl GenerationRequestBuilder {
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.request.temperature = temperature;
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.request.top_p = top_p;
        self
    }

    pub fn top_k(mut self, top_k: u32) -> Self {
        self.request.top_k = top_k;
        self
    }

    pub fn num_beams(mut self, num_beams: u32) -> Self {
        self.request.num_beams = num_beams;
        self
    }

    pub fn max_new_tokens(mut self, max_new_tokens: u32) -> Self {
        self.request.max_new_tokens = max_new_tokens;
        self
    }

    pub fn stream_output(mut self, stream_output: bool) -> Self {
        self.request.stream_output = stream_output;
        self
    }

    /// Make sampling reproducible
    pub fn seed(mut self, seed: u32) -> Self {
        self.request.seed = Some(seed);
        self
    }

    /// Validate and return the finished request
    pub fn build(self) -> Result<GenerationRequest, ValidationError> {
        self.request.validate()?;
        Ok(self.request)
    }
}
