//! Settings storage
//!
//! Manages persistence of model, device and generation settings.

use crate::storage::{get_data_dir, StorageError};
use crate::types::request::{GenerationRequestBuilder, MAX_BEAMS, MAX_NEW_TOKENS_LIMIT};
use crate::types::{DevicePreference, GenerationRequest};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable consulted when no base model is configured
pub const BASE_MODEL_ENV: &str = "BASE_MODEL";

/// Sampling defaults applied to requests that do not override them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    /// Temperature parameter for text generation (0.0 - 1.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Number of beams (1 - 4)
    pub num_beams: u32,
    /// Maximum number of tokens to generate
    pub max_new_tokens: u32,
    /// Stream the answer as it is generated
    pub stream_output: bool,
    /// Fixed sampling seed (unset = random per request)
    pub seed: Option<u32>,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.75,
            top_k: 40,
            num_beams: 4,
            max_new_tokens: 512,
            stream_output: true,
            seed: None,
        }
    }
}

impl GenerationDefaults {
    /// Start a request for `instruction` pre-filled with these defaults
    pub fn request(&self, instruction: impl Into<String>) -> GenerationRequestBuilder {
        let builder = GenerationRequest::builder(instruction)
            .temperature(self.temperature)
            .top_p(self.top_p)
            .top_k(self.top_k)
            .num_beams(self.num_beams)
            .max_new_tokens(self.max_new_tokens)
            .stream_output(self.stream_output);
        match self.seed {
            Some(seed) => builder.seed(seed),
            None => builder,
        }
    }
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Path to the base GGUF model
    #[serde(default)]
    pub base_model: String,
    /// Optional LoRA adapter weights (GGUF)
    #[serde(default)]
    pub lora_weights: Option<PathBuf>,
    /// Scale applied to the LoRA adapter
    #[serde(default = "default_lora_scale")]
    pub lora_scale: f32,
    /// Prompt template name or path to a template JSON file (empty = alpaca)
    #[serde(default)]
    pub prompt_template: String,
    /// Directory searched for named prompt templates
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
    /// Device preference, resolved once at startup
    #[serde(default)]
    pub device: DevicePreference,
    /// Number of GPU layers to offload when running on a GPU
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: u32,
    /// Context window size
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    /// Generation defaults
    #[serde(default)]
    pub defaults: GenerationDefaults,
}

fn default_lora_scale() -> f32 {
    1.0
}

fn default_templates_dir() -> PathBuf {
    get_data_dir()
        .ok()
        .map(|d| d.join("templates"))
        .unwrap_or_else(|| PathBuf::from("./templates"))
}

fn default_gpu_layers() -> u32 {
    99 // Offload all layers to GPU by default
}

fn default_context_size() -> u32 {
    4096
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            base_model: String::new(),
            lora_weights: None,
            lora_scale: default_lora_scale(),
            prompt_template: String::new(),
            templates_dir: default_templates_dir(),
            device: DevicePreference::Auto,
            gpu_layers: default_gpu_layers(),
            context_size: default_context_size(),
            defaults: GenerationDefaults::default(),
        }
    }
}

impl AppSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges.
    pub fn validate(&mut self) {
        self.lora_scale = self.lora_scale.clamp(0.0, 2.0);

        // Valid context sizes
        let valid_context_sizes = [2048, 4096, 8192, 16384, 32768];
        if !valid_context_sizes.contains(&self.context_size) {
            self.context_size = *valid_context_sizes
                .iter()
                .min_by_key(|&&size| (size as i64 - self.context_size as i64).abs())
                .unwrap_or(&4096);
        }

        let d = &mut self.defaults;
        d.temperature = d.temperature.clamp(0.0, 1.0);
        d.top_p = d.top_p.clamp(0.0, 1.0);
        d.num_beams = d.num_beams.clamp(1, MAX_BEAMS);
        d.max_new_tokens = d.max_new_tokens.clamp(1, MAX_NEW_TOKENS_LIMIT);

        // Leave room for the prompt
        if d.max_new_tokens > self.context_size / 2 {
            tracing::warn!(
                "max_new_tokens {} too large for a {} context, capping",
                d.max_new_tokens,
                self.context_size
            );
            d.max_new_tokens = self.context_size / 2;
        }
    }

    /// Fill an empty base model from the `BASE_MODEL` environment variable
    pub fn apply_env(&mut self) {
        if self.base_model.trim().is_empty() {
            if let Ok(model) = std::env::var(BASE_MODEL_ENV) {
                self.base_model = model;
            }
        }
    }
}

/// Get the settings file path
pub fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> AppSettings {
    let loaded = get_settings_path().and_then(|path| load_settings_from(&path));
    match loaded {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            AppSettings::default()
        }
    }
}

/// Load and validate settings from an explicit path
pub fn load_settings_from(path: &Path) -> Result<AppSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(AppSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: AppSettings = serde_json::from_str(&json)?;

    settings.validate();

    tracing::debug!("Loaded settings from {:?}", path);
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &AppSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

/// Save settings to an explicit path
pub fn save_settings_to(settings: &AppSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AppSettings::default();
        assert!(settings.base_model.is_empty());
        assert!(settings.lora_weights.is_none());
        assert_eq!(settings.device, DevicePreference::Auto);
        assert_eq!(settings.context_size, 4096);
        assert_eq!(settings.defaults, GenerationDefaults::default());
    }

    #[test]
    fn test_defaults_build_valid_request() {
        let request = GenerationDefaults::default()
            .request("What does the Fourth Amendment protect?")
            .build()
            .unwrap();
        assert_eq!(request.num_beams(), 4);
        assert_eq!(request.max_new_tokens(), 512);
        assert!(request.stream_output());
        assert_eq!(request.seed(), None);

        let seeded = GenerationDefaults {
            seed: Some(1234),
            ..GenerationDefaults::default()
        };
        assert_eq!(seeded.request("q").build().unwrap().seed(), Some(1234));
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = AppSettings::default();

        settings.defaults.temperature = 5.0;
        settings.defaults.top_p = -1.0;
        settings.defaults.num_beams = 9;
        settings.context_size = 5000;
        settings.validate();

        assert_eq!(settings.defaults.temperature, 1.0);
        assert_eq!(settings.defaults.top_p, 0.0);
        assert_eq!(settings.defaults.num_beams, 4);
        assert_eq!(settings.context_size, 4096);
    }

    #[test]
    fn test_max_new_tokens_capped_by_context() {
        let mut settings = AppSettings::default();
        settings.context_size = 2048;
        settings.defaults.max_new_tokens = 2000;
        settings.validate();
        assert_eq!(settings.defaults.max_new_tokens, 1024);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"base_model": "/models/legal-7b.gguf", "device": "cpu"}"#)
                .unwrap();
        assert_eq!(settings.base_model, "/models/legal-7b.gguf");
        assert_eq!(settings.device, DevicePreference::Cpu);
        assert_eq!(settings.gpu_layers, 99);
        assert_eq!(settings.defaults.top_k, 40);
    }

    #[test]
    fn test_settings_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = AppSettings::default();
        settings.base_model = "/models/legal-7b.gguf".to_string();
        settings.lora_weights = Some(PathBuf::from("/models/legal-lora.gguf"));
        settings.defaults.stream_output = false;
        settings.defaults.seed = Some(99);
        save_settings_to(&settings, &path).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded.base_model, settings.base_model);
        assert_eq!(loaded.lora_weights, settings.lora_weights);
        assert!(!loaded.defaults.stream_output);
        assert_eq!(loaded.defaults.seed, Some(99));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded.context_size, 4096);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_settings_from(&path), Err(StorageError::Json(_))));
    }
}
