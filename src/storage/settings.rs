//! Settings storage
//!
//! Loads the optional `settings.json` from the data directory. There are no
//! command-line flags; every field falls back to its default.

use crate::inference::{GenerationParams, LoadOptions};
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Model loaded when no settings file says otherwise
pub const DEFAULT_MODEL_FILENAME: &str = "Meta-Llama-3-8B-Instruct.Q4_0.gguf";

/// Where the default model is fetched from on first use
pub const DEFAULT_MODEL_URL: &str =
    "https://gpt4all.io/models/gguf/Meta-Llama-3-8B-Instruct.Q4_0.gguf";

/// Token limit for the single completion
pub const DEFAULT_MAX_TOKENS: u32 = 512;

const MIN_CONTEXT_SIZE: u32 = 512;

/// Chat settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// File name (or path) of the GGUF model
    pub model_filename: String,
    /// Directory searched for `model_filename`
    pub models_directory: PathBuf,
    /// Source URL used when the model is missing
    pub model_url: Option<String>,
    /// Fetch the model on first use
    pub allow_download: bool,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Context window size
    pub context_size: u32,
    /// Prompt evaluation batch size
    pub batch_size: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Min-p sampling parameter (0.0 - 1.0)
    pub min_p: f32,
    /// Repetition penalty (1.0 = off)
    pub repeat_penalty: f32,
    /// Number of recent tokens the repetition penalty looks at
    pub repeat_last_n: i32,
    /// Sampler seed
    pub seed: u32,
    /// Optional system prompt opening the session
    pub system_prompt: String,
    /// Forward llama.cpp's own log output to tracing
    pub llama_logs: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model_filename: DEFAULT_MODEL_FILENAME.to_string(),
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
            model_url: Some(DEFAULT_MODEL_URL.to_string()),
            allow_download: true,
            max_tokens: DEFAULT_MAX_TOKENS,
            context_size: 2048,
            batch_size: 512,
            gpu_layers: 0,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.4,
            min_p: 0.0,
            repeat_penalty: 1.18,
            repeat_last_n: 64,
            seed: 0,
            system_prompt: String::new(),
            llama_logs: false,
        }
    }
}

impl ChatSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within ranges llama.cpp accepts.
    pub fn validate(&mut self) {
        if self.model_filename.trim().is_empty() {
            self.model_filename = DEFAULT_MODEL_FILENAME.to_string();
        }

        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        self.min_p = self.min_p.clamp(0.0, 1.0);

        if self.top_k == 0 {
            self.top_k = 40;
        }

        if self.repeat_penalty < 1.0 {
            self.repeat_penalty = 1.0;
        }
        if self.repeat_last_n < 0 {
            self.repeat_last_n = 0;
        }

        self.context_size = self.context_size.max(MIN_CONTEXT_SIZE);
        self.batch_size = self.batch_size.clamp(1, self.context_size);

        // Can't generate more than the context allows
        self.max_tokens = self.max_tokens.clamp(1, self.context_size);
    }

    /// Sampling parameters for the completion
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            min_p: self.min_p,
            repeat_penalty: self.repeat_penalty,
            repeat_last_n: self.repeat_last_n,
            seed: self.seed,
        }
    }

    /// Options for loading the model and sizing its context
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            gpu_layers: self.gpu_layers,
            context_size: self.context_size,
            batch_size: self.batch_size,
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
pub fn load_settings() -> ChatSettings {
    let result = get_settings_path().and_then(|path| load_settings_from(&path));
    match result {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            ChatSettings::default()
        }
    }
}

/// Load and validate settings from a specific file
pub fn load_settings_from(path: &Path) -> Result<ChatSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(ChatSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: ChatSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {:?}", path);
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ChatSettings::default();
        assert_eq!(settings.model_filename, "Meta-Llama-3-8B-Instruct.Q4_0.gguf");
        assert_eq!(settings.max_tokens, 512);
        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.top_k, 40);
        assert!(settings.allow_download);
        assert!(settings.system_prompt.is_empty());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = ChatSettings::default();

        settings.temperature = 5.0;
        settings.top_p = 2.0;
        settings.min_p = -1.0;
        settings.top_k = 0;
        settings.repeat_penalty = 0.5;
        settings.validate();
        assert_eq!(settings.temperature, 2.0);
        assert_eq!(settings.top_p, 1.0);
        assert_eq!(settings.min_p, 0.0);
        assert_eq!(settings.top_k, 40);
        assert_eq!(settings.repeat_penalty, 1.0);

        settings.temperature = -1.0;
        settings.validate();
        assert_eq!(settings.temperature, 0.0);
    }

    #[test]
    fn test_max_tokens_capped_to_context() {
        let mut settings = ChatSettings::default();
        settings.context_size = 100;
        settings.max_tokens = 100_000;
        settings.batch_size = 4096;
        settings.validate();
        assert_eq!(settings.context_size, 512);
        assert_eq!(settings.max_tokens, 512);
        assert_eq!(settings.batch_size, 512);

        settings.max_tokens = 0;
        settings.validate();
        assert_eq!(settings.max_tokens, 1);
    }

    #[test]
    fn test_empty_model_filename_reset() {
        let mut settings = ChatSettings::default();
        settings.model_filename = "   ".to_string();
        settings.validate();
        assert_eq!(settings.model_filename, DEFAULT_MODEL_FILENAME);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "max_tokens": 64, "allow_download": false }"#).unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.max_tokens, 64);
        assert!(!settings.allow_download);
        assert_eq!(settings.model_filename, DEFAULT_MODEL_FILENAME);
        assert_eq!(settings.temperature, 0.7);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_settings_from(&path),
            Err(StorageError::Json(_))
        ));
    }

    #[test]
    fn test_generation_params_follow_settings() {
        let settings = ChatSettings::default();
        let params = settings.generation_params();
        assert_eq!(params.max_tokens, 512);
        assert_eq!(params.top_p, 0.4);
        assert_eq!(params.repeat_last_n, 64);

        let options = settings.load_options();
        assert_eq!(options.context_size, 2048);
        assert_eq!(options.gpu_layers, 0);
    }
}
