use async_trait::async_trait;
use bytes::Bytes;
use llm_fanout_rs::{
    AppConfig, Backend, BackendConfig, BackendHandle, InferenceError, JinjaTemplates,
    LlmBackendService, ModelResolver, PredictOptions, PromptTemplates,
};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Configuration for mock backend behavior
#[derive(Clone, Debug, Default)]
pub struct MockBackendConfig {
    pub reply: String,
    /// Raw chunks to stream. Defaults to the reply cut into 3-byte pieces.
    pub chunks: Option<Vec<Vec<u8>>>,
    /// `None` makes tokenization fail.
    pub prompt_tokens: Option<u32>,
    /// Zero-based call numbers that fail before producing anything.
    pub failing_calls: Vec<usize>,
    /// Streaming calls fail after sending this many chunks.
    pub fail_after_chunks: Option<usize>,
    pub max_delay_ms: u64,
    /// Never finish and ignore cancellation.
    pub hang: bool,
    /// Tokenization never finishes and ignores cancellation.
    pub hang_tokenize: bool,
}

pub struct MockBackend {
    config: MockBackendConfig,
    calls: AtomicUsize,
    seen: Mutex<Vec<PredictOptions>>,
}

#[allow(dead_code)]
impl MockBackend {
    pub fn new(config: MockBackendConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn replying(reply: &str) -> Arc<Self> {
        Self::new(MockBackendConfig {
            reply: reply.to_string(),
            prompt_tokens: Some(4),
            max_delay_ms: 10,
            ..MockBackendConfig::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<PredictOptions> {
        self.seen.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.seen().into_iter().map(|o| o.prompt).collect()
    }

    async fn start_call(&self, opts: &PredictOptions) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(opts.clone());

        let delay = if self.config.max_delay_ms > 0 {
            rand::rng().random_range(0..=self.config.max_delay_ms)
        } else {
            0
        };
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;

        if self.config.hang {
            std::future::pending::<()>().await;
        }
        if self.config.failing_calls.contains(&call) {
            anyhow::bail!("mock backend failed call {}", call);
        }
        Ok(())
    }

    fn chunks(&self) -> Vec<Vec<u8>> {
        match &self.config.chunks {
            Some(chunks) => chunks.clone(),
            None => self
                .config
                .reply
                .as_bytes()
                .chunks(3)
                .map(|c| c.to_vec())
                .collect(),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn predict(
        &self,
        _cancel: &CancellationToken,
        opts: &PredictOptions,
    ) -> anyhow::Result<String> {
        self.start_call(opts).await?;
        Ok(self.config.reply.clone())
    }

    async fn predict_stream(
        &self,
        _cancel: &CancellationToken,
        opts: &PredictOptions,
        chunks: mpsc::Sender<Bytes>,
    ) -> anyhow::Result<()> {
        self.start_call(opts).await?;
        for (sent, chunk) in self.chunks().into_iter().enumerate() {
            if self.config.fail_after_chunks == Some(sent) {
                anyhow::bail!("mock backend stream broke after {} chunks", sent);
            }
            if chunks.send(Bytes::from(chunk)).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn tokenize(
        &self,
        _cancel: &CancellationToken,
        _opts: &PredictOptions,
    ) -> anyhow::Result<u32> {
        if self.config.hang_tokenize {
            std::future::pending::<()>().await;
        }
        self.config
            .prompt_tokens
            .ok_or_else(|| anyhow::anyhow!("tokenizer unavailable"))
    }
}

/// Resolves every model to the same backend, optionally failing the first
/// few resolutions.
pub struct MockResolver {
    backend: BackendHandle,
    failures_left: AtomicUsize,
}

#[allow(dead_code)]
impl MockResolver {
    pub fn new(backend: Arc<MockBackend>) -> Arc<Self> {
        Self::failing_first(backend, 0)
    }

    pub fn failing_first(backend: Arc<MockBackend>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            backend,
            failures_left: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl ModelResolver for MockResolver {
    async fn resolve(&self, config: &BackendConfig) -> Result<BackendHandle, InferenceError> {
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(InferenceError::resolution(&config.model, "backend unavailable"));
        }
        Ok(self.backend.clone())
    }
}

/// Templates whose evaluation always fails.
#[allow(dead_code)]
pub struct BrokenTemplates;

impl PromptTemplates for BrokenTemplates {
    fn exists(&self, _name: &str) -> bool {
        true
    }

    fn evaluate(
        &self,
        name: &str,
        _data: &llm_fanout_rs::PromptTemplateData,
    ) -> anyhow::Result<String> {
        anyhow::bail!("template {} is broken", name)
    }
}

#[allow(dead_code)]
pub fn service(resolver: Arc<MockResolver>) -> LlmBackendService {
    service_with(resolver, Arc::new(JinjaTemplates::new()), AppConfig::default())
}

#[allow(dead_code)]
pub fn service_with(
    resolver: Arc<MockResolver>,
    templates: Arc<dyn PromptTemplates>,
    app_config: AppConfig,
) -> LlmBackendService {
    let _ = llm_fanout_rs::logging::init_logging(log::LevelFilter::Debug);
    LlmBackendService::new(resolver, templates, app_config)
}

#[allow(dead_code)]
pub fn model_config(prompts: &[&str]) -> BackendConfig {
    BackendConfig {
        model: "mock-model".to_string(),
        prompt_strings: prompts.iter().map(|p| p.to_string()).collect(),
        ..BackendConfig::default()
    }
}
