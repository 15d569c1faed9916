//! Fan-out/fan-in engine for OpenAI-compatible text generation over
//! out-of-process model backends.
//!
//! A request is split into one completion fan-out per prompt string, each of
//! which runs `n` backend invocations concurrently. Results are folded back
//! into a single [`AggregatedResponse`] while raw completions and decoded
//! tokens can be observed live.

pub mod backend;
pub mod concurrency;
pub mod config;
pub mod decoder;
pub mod error;
pub mod fanout;
pub mod finetune;
pub mod io_struct;
pub mod llm_state;
pub mod loader;
pub mod logging;
pub mod templates;

pub use backend::{Backend, BackendHandle, BackendLauncher, ModelInstaller, PredictOptions};
pub use config::{AppConfig, BackendConfig, PartialResultPolicy, TemplateConfig};
pub use error::InferenceError;
pub use fanout::{EndpointConfig, GeneratedText, GenerationStreams};
pub use finetune::{Finetuner, PatternCache};
pub use io_struct::{
    AggregatedResponse, ApiRequest, Choice, InferenceRequest, InferenceResult, ResponseBundle,
    TokenUsage,
};
pub use llm_state::{InferenceStreams, LlmBackendService};
pub use loader::{ModelLoader, ModelResolver};
pub use templates::{JinjaTemplates, PromptTemplateData, PromptTemplates};
