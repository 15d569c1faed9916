use crate::backend::{BackendHandle, PredictOptions};
use crate::concurrency::STREAM_CAPACITY;
use crate::config::{AppConfig, BackendConfig};
use crate::decoder::Utf8StreamDecoder;
use crate::error::InferenceError;
use crate::finetune::Finetuner;
use crate::io_struct::{InferenceOutcome, InferenceRequest, InferenceResult, TokenUsage};
use crate::loader::ModelResolver;
use crate::templates::PromptTemplates;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffer between a backend and the decoder reading its raw chunks.
const CHUNK_BUFFER: usize = 16;

/// Streams of one backend invocation.
///
/// `results` yields exactly one value: the whole completion, or the error
/// that ended it. `tokens` is present only when a live token stream was
/// requested; it yields one value per decoded code point and closes before
/// the result is sent.
pub struct InferenceStreams {
    pub results: mpsc::Receiver<InferenceOutcome>,
    pub tokens: Option<mpsc::Receiver<InferenceResult>>,
}

#[derive(Clone)]
pub struct LlmBackendService {
    pub(crate) resolver: Arc<dyn ModelResolver>,
    pub(crate) templates: Arc<dyn PromptTemplates>,
    pub(crate) finetuner: Finetuner,
    pub(crate) app_config: AppConfig,
}

impl LlmBackendService {
    pub fn new(
        resolver: Arc<dyn ModelResolver>,
        templates: Arc<dyn PromptTemplates>,
        app_config: AppConfig,
    ) -> Self {
        Self {
            resolver,
            templates,
            finetuner: Finetuner::default(),
            app_config,
        }
    }

    pub fn with_finetuner(mut self, finetuner: Finetuner) -> Self {
        self.finetuner = finetuner;
        self
    }

    pub fn finetuner(&self) -> &Finetuner {
        &self.finetuner
    }

    pub fn app_config(&self) -> &AppConfig {
        &self.app_config
    }

    /// Shapes a finished completion with the model's echo, cut and trim rules.
    pub fn finetune(&self, config: &BackendConfig, input: &str, prediction: &str) -> String {
        self.finetuner.finetune(config, input, prediction)
    }

    /// Runs one backend invocation in the background.
    ///
    /// Fails only when no backend could be resolved or `cancel` fired before
    /// the backend call started; every later failure is delivered on the
    /// result stream.
    pub async fn inference(
        &self,
        cancel: CancellationToken,
        request: InferenceRequest,
        config: &BackendConfig,
        enable_token_stream: bool,
    ) -> Result<InferenceStreams, InferenceError> {
        let backend = until_cancelled(&cancel, self.resolver.resolve(config)).await??;
        let opts = PredictOptions::new(config, &self.app_config)
            .with_input(&request.text, &request.images);
        let request = Arc::new(request);

        let usage = TokenUsage {
            prompt: until_cancelled(&cancel, prompt_tokens(&backend, &cancel, &opts)).await?,
            completion: 0,
        };

        let (result_tx, result_rx) = mpsc::channel(STREAM_CAPACITY);

        if !enable_token_stream {
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    reply = backend.predict(&cancel, &opts) => reply
                        .map(|text| InferenceResult { request, text, usage })
                        .map_err(InferenceError::from),
                    _ = cancel.cancelled() => Err(InferenceError::Cancelled),
                };
                if result_tx.send(outcome).await.is_err() {
                    log::debug!("Result of a dropped invocation discarded");
                }
            });
            return Ok(InferenceStreams {
                results: result_rx,
                tokens: None,
            });
        }

        let (token_tx, token_rx) = mpsc::channel(STREAM_CAPACITY);
        tokio::spawn(async move {
            let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(CHUNK_BUFFER);
            let call = async {
                tokio::select! {
                    res = backend.predict_stream(&cancel, &opts, chunk_tx) => res.map_err(InferenceError::from),
                    _ = cancel.cancelled() => Err(InferenceError::Cancelled),
                }
            };
            let token_request = request.clone();
            let mut on_token = |text: String, usage: TokenUsage| {
                let token_tx = token_tx.clone();
                let request = token_request.clone();
                async move {
                    // Unsubscribed token streams are not an error.
                    let _ = token_tx.send(InferenceResult { request, text, usage }).await;
                    true
                }
            };
            let mut tokens = TokenDecoder::new(usage);
            let (outcome, ()) = tokio::join!(call, tokens.drain(chunk_rx, &mut on_token));
            let outcome = match outcome {
                Ok(()) => {
                    let (text, usage) = tokens.finish(&mut on_token).await;
                    Ok(InferenceResult {
                        request,
                        text,
                        usage,
                    })
                }
                Err(e) => Err(e),
            };
            drop(token_tx);

            if result_tx.send(outcome).await.is_err() {
                log::debug!("Result of a dropped invocation discarded");
            }
        });

        Ok(InferenceStreams {
            results: result_rx,
            tokens: Some(token_rx),
        })
    }

    /// Runs one invocation to completion on the caller's task.
    ///
    /// With a callback, output is streamed and `callback(token, usage)` is
    /// called per decoded code point; returning `false` stops generation and
    /// keeps the text produced so far. The model's `usage` feature flag turns
    /// on prompt tokenization and forces streaming so completion tokens are
    /// counted even without a callback.
    pub async fn model_inference<F>(
        &self,
        cancel: &CancellationToken,
        text: &str,
        images: &[String],
        config: &BackendConfig,
        callback: Option<F>,
    ) -> Result<InferenceResult, InferenceError>
    where
        F: FnMut(&str, TokenUsage) -> bool + Send,
    {
        let backend = until_cancelled(cancel, self.resolver.resolve(config)).await??;
        let opts = PredictOptions::new(config, &self.app_config).with_input(text, images);
        let request = Arc::new(InferenceRequest {
            id: 0,
            text: text.to_string(),
            images: images.to_vec(),
        });

        let count_usage = config.feature_enabled("usage");
        let mut usage = TokenUsage::default();
        if count_usage {
            usage.prompt = until_cancelled(cancel, prompt_tokens(&backend, cancel, &opts)).await?;
        }

        let Some(callback) = callback else {
            if count_usage {
                return self
                    .stream_with_callback(&backend, cancel, &opts, request, usage, |_, _| true)
                    .await;
            }
            let reply = tokio::select! {
                reply = backend.predict(cancel, &opts) => reply?,
                _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
            };
            return Ok(InferenceResult {
                request,
                text: reply,
                usage,
            });
        };

        self.stream_with_callback(&backend, cancel, &opts, request, usage, callback)
            .await
    }

    async fn stream_with_callback<F>(
        &self,
        backend: &BackendHandle,
        cancel: &CancellationToken,
        opts: &PredictOptions,
        request: Arc<InferenceRequest>,
        usage: TokenUsage,
        mut callback: F,
    ) -> Result<InferenceResult, InferenceError>
    where
        F: FnMut(&str, TokenUsage) -> bool + Send,
    {
        let stop = cancel.child_token();
        let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(CHUNK_BUFFER);
        let call = async {
            tokio::select! {
                res = backend.predict_stream(&stop, opts, chunk_tx) => res.map_err(InferenceError::from),
                _ = stop.cancelled() => Err(InferenceError::Cancelled),
            }
        };
        let mut on_token = |token: String, usage| {
            let keep_going = callback(&token, usage);
            if !keep_going {
                stop.cancel();
            }
            std::future::ready(keep_going)
        };
        let mut tokens = TokenDecoder::new(usage);
        let (outcome, ()) = tokio::join!(call, tokens.drain(chunk_rx, &mut on_token));

        let (text, usage) = match outcome {
            Ok(()) => tokens.finish(&mut on_token).await,
            // Stopped by the callback rather than by the caller.
            Err(InferenceError::Cancelled) if !cancel.is_cancelled() => tokens.into_parts(),
            Err(e) => return Err(e),
        };
        Ok(InferenceResult {
            request,
            text,
            usage,
        })
    }
}

/// Prompt token count, or zero when the backend cannot tokenize.
async fn prompt_tokens(
    backend: &BackendHandle,
    cancel: &CancellationToken,
    opts: &PredictOptions,
) -> u32 {
    match backend.tokenize(cancel, opts).await {
        Ok(count) => count,
        Err(e) => {
            log::debug!("Tokenization failed, prompt usage left at zero: {:#}", e);
            0
        }
    }
}

/// Awaits `fut` unless `cancel` fires first. An already cancelled token wins
/// even when `fut` is ready.
async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, InferenceError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(InferenceError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Turns raw backend chunks into code point tokens, counting one completion
/// token per code point.
struct TokenDecoder {
    decoder: Utf8StreamDecoder,
    text: String,
    usage: TokenUsage,
    reporting: bool,
}

impl TokenDecoder {
    fn new(usage: TokenUsage) -> Self {
        TokenDecoder {
            decoder: Utf8StreamDecoder::new(),
            text: String::new(),
            usage,
            reporting: true,
        }
    }

    /// Decodes until the backend closes the stream. Once `on_token` returns
    /// `false` remaining chunks are drained but not reported.
    async fn drain<F, Fut>(&mut self, mut chunks: mpsc::Receiver<Bytes>, on_token: &mut F)
    where
        F: FnMut(String, TokenUsage) -> Fut,
        Fut: Future<Output = bool>,
    {
        while let Some(chunk) = chunks.recv().await {
            if !self.reporting {
                continue;
            }
            for c in self.decoder.push(&chunk) {
                if !self.emit(c, on_token).await {
                    break;
                }
            }
        }
    }

    /// Flushes a truncated trailing code point. Only valid once the backend
    /// has finished cleanly; after a failure the pending bytes are dropped
    /// with the decoder.
    async fn finish<F, Fut>(mut self, on_token: &mut F) -> (String, TokenUsage)
    where
        F: FnMut(String, TokenUsage) -> Fut,
        Fut: Future<Output = bool>,
    {
        if self.reporting {
            if let Some(c) = self.decoder.finish() {
                self.emit(c, on_token).await;
            }
        }
        self.into_parts()
    }

    fn into_parts(self) -> (String, TokenUsage) {
        (self.text, self.usage)
    }

    async fn emit<F, Fut>(&mut self, c: char, on_token: &mut F) -> bool
    where
        F: FnMut(String, TokenUsage) -> Fut,
        Fut: Future<Output = bool>,
    {
        self.usage.completion = self.usage.completion.saturating_add(1);
        self.text.push(c);
        self.reporting = on_token(c.to_string(), self.usage).await;
        self.reporting
    }
}
