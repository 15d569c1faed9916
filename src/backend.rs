//! Contracts of the out-of-process model backends.

use crate::config::{AppConfig, BackendConfig};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-call options handed to a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredictOptions {
    pub prompt: String,
    pub images: Vec<String>,
    pub threads: usize,
    pub grammar: Option<String>,
    pub model_path: PathBuf,
}

impl PredictOptions {
    pub fn new(config: &BackendConfig, app_config: &AppConfig) -> Self {
        Self {
            prompt: String::new(),
            images: Vec::new(),
            threads: config.threads,
            grammar: config.grammar.clone(),
            model_path: app_config.model_path.clone(),
        }
    }

    pub fn with_input(mut self, prompt: &str, images: &[String]) -> Self {
        self.prompt = prompt.to_string();
        self.images = images.to_vec();
        self
    }
}

/// A loaded model backend.
///
/// Implementations are expected to stop work when `cancel` fires; callers
/// additionally stop waiting on them at that point.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Generates one complete response.
    async fn predict(&self, cancel: &CancellationToken, opts: &PredictOptions)
    -> anyhow::Result<String>;

    /// Streams raw output bytes into `chunks`. Chunks may end in the middle of
    /// a multi-byte code point. Returning closes the stream.
    async fn predict_stream(
        &self,
        cancel: &CancellationToken,
        opts: &PredictOptions,
        chunks: mpsc::Sender<Bytes>,
    ) -> anyhow::Result<()>;

    /// Number of tokens the prompt encodes to.
    async fn tokenize(&self, cancel: &CancellationToken, opts: &PredictOptions)
    -> anyhow::Result<u32>;
}

pub type BackendHandle = Arc<dyn Backend>;

/// Starts a backend process for a model.
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(
        &self,
        backend: &str,
        model: &str,
        config: &BackendConfig,
    ) -> anyhow::Result<BackendHandle>;
}

/// Downloads a model that is missing locally.
#[async_trait]
pub trait ModelInstaller: Send + Sync {
    async fn install(&self, model: &str, model_path: &std::path::Path) -> anyhow::Result<()>;
}
