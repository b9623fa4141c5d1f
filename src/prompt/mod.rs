//! Prompt templates and answer extraction
//!
//! A template turns an instruction into the exact prompt fed to the model and
//! names the marker after which the model's answer starts.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the built-in template
pub const DEFAULT_TEMPLATE: &str = "alpaca";

/// Errors raised while loading a prompt template
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Template not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid template JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Template {name} is missing the {placeholder} placeholder")]
    MissingPlaceholder {
        name: String,
        placeholder: &'static str,
    },
}

/// Prompt template file layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub description: String,
    /// Template used when an input/context accompanies the instruction
    pub prompt_input: String,
    /// Template used for a bare instruction
    pub prompt_no_input: String,
    /// Marker that precedes the answer in decoded output
    pub response_split: String,
}

impl PromptTemplate {
    /// The alpaca instruction template
    pub fn alpaca() -> Self {
        Self {
            description: "Template used by Alpaca-LoRA.".to_string(),
            prompt_input: concat!(
                "Below is an instruction that describes a task, paired with an input that ",
                "provides further context. Write a response that appropriately completes ",
                "the request.\n\n### Instruction:\n{instruction}\n\n### Input:\n{input}",
                "\n\n### Response:\n",
            )
            .to_string(),
            prompt_no_input: concat!(
                "Below is an instruction that describes a task. Write a response that ",
                "appropriately completes the request.\n\n### Instruction:\n{instruction}",
                "\n\n### Response:\n",
            )
            .to_string(),
            response_split: "### Response:".to_string(),
        }
    }

    /// Load a template from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, PromptError> {
        if !path.exists() {
            return Err(PromptError::NotFound(path.to_path_buf()));
        }
        let json = fs::read_to_string(path)?;
        let template: PromptTemplate = serde_json::from_str(&json)?;
        template.check(&path.display().to_string())?;
        Ok(template)
    }

    fn check(&self, name: &str) -> Result<(), PromptError> {
        let missing = |placeholder| PromptError::MissingPlaceholder {
            name: name.to_string(),
            placeholder,
        };
        if !self.prompt_no_input.contains("{instruction}")
            || !self.prompt_input.contains("{instruction}")
        {
            return Err(missing("{instruction}"));
        }
        if !self.prompt_input.contains("{input}") {
            return Err(missing("{input}"));
        }
        Ok(())
    }
}

/// Pulls the answer out of the model's cumulative decoded text
pub trait ResponseExtractor: Send + Sync {
    fn extract(&self, decoded: &str) -> String;
}

/// Renders prompts and extracts answers for one template
#[derive(Debug, Clone)]
pub struct Prompter {
    template: PromptTemplate,
}

impl Default for Prompter {
    fn default() -> Self {
        Self::new(PromptTemplate::alpaca())
    }
}

impl Prompter {
    pub fn new(template: PromptTemplate) -> Self {
        Self { template }
    }

    /// Resolve a template by name
    ///
    /// An empty name or `alpaca` selects the built-in template. A name ending
    /// in `.json` is read as a path; anything else is looked up as
    /// `<templates_dir>/<name>.json`.
    pub fn load(name: &str, templates_dir: &Path) -> Result<Self, PromptError> {
        let name = name.trim();
        if name.is_empty() || name == DEFAULT_TEMPLATE {
            return Ok(Self::default());
        }

        let path = if name.ends_with(".json") {
            PathBuf::from(name)
        } else {
            templates_dir.join(format!("{}.json", name))
        };

        let template = PromptTemplate::from_file(&path)?;
        tracing::info!("Using prompt template {}: {}", name, template.description);
        Ok(Self::new(template))
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    /// Build the exact prompt fed to the model
    pub fn generate_prompt(&self, instruction: &str, input: Option<&str>) -> String {
        match input.filter(|i| !i.trim().is_empty()) {
            Some(input) => self
                .template
                .prompt_input
                .replace("{instruction}", instruction)
                .replace("{input}", input),
            None => self.template.prompt_no_input.replace("{instruction}", instruction),
        }
    }

    /// Text between the first response marker and the next one, trimmed
    ///
    /// Falls back to the whole decoded text, trimmed, when the marker is absent.
    pub fn get_response(&self, decoded: &str) -> String {
        let marker = self.template.response_split.as_str();
        match decoded.split_once(marker) {
            Some((_, after)) => {
                let answer = after.split(marker).next().unwrap_or(after);
                answer.trim().to_string()
            }
            None => {
                tracing::debug!("Response marker not found, returning full decoded text");
                decoded.trim().to_string()
            }
        }
    }
}

impl ResponseExtractor for Prompter {
    fn extract(&self, decoded: &str) -> String {
        self.get_response(decoded)
    }
}
