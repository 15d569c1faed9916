use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Template names per endpoint. `None` falls back to a template named after
/// the model, if one exists.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub completion: Option<String>,
    pub edit: Option<String>,
}

/// Per-model configuration, already merged with the incoming request.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub name: String,
    pub model: String,
    /// Backend to load the model with. `None` tries every known backend.
    pub backend: Option<String>,
    pub threads: usize,
    pub prompt_strings: Vec<String>,
    pub template: TemplateConfig,
    pub system_prompt: String,

    pub echo: bool,
    pub cutstrings: Vec<String>,
    /// Prefixes stripped from a finished completion.
    pub trim_space: Vec<String>,
    pub trim_suffix: Vec<String>,

    pub grammar: Option<String>,
    pub feature_flags: HashMap<String, bool>,
}

impl BackendConfig {
    pub fn feature_enabled(&self, flag: &str) -> bool {
        self.feature_flags.get(flag).copied().unwrap_or(false)
    }
}

/// What a reduction does with its accumulator once an error has been folded in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialResultPolicy {
    /// Keep accumulating; the result is flagged as failed but carries
    /// everything gathered.
    #[default]
    Keep,
    /// Drop what was gathered and ignore later values.
    Discard,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub model_path: PathBuf,
    /// Install models missing from `model_path` before loading them.
    pub autoload_galleries: bool,
    pub partial_results: PartialResultPolicy,
    /// Backends tried in order when a model names none.
    pub backends: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models"),
            autoload_galleries: false,
            partial_results: PartialResultPolicy::Keep,
            backends: vec!["llama-cpp".to_string()],
        }
    }
}
