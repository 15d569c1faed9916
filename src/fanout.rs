use crate::concurrency::{STREAM_CAPACITY, merge, reduce, tee};
use crate::config::{BackendConfig, PartialResultPolicy};
use crate::error::InferenceError;
use crate::finetune::Finetuner;
use crate::io_struct::{
    AggregatedResponse, ApiRequest, Choice, InferenceOutcome, InferenceRequest, InferenceResult,
    ResponseBundle, TokenUsage, Usage,
};
use crate::llm_state::LlmBackendService;
use crate::templates::PromptTemplateData;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// GBNF grammar constraining output to a single JSON value.
pub const JSON_GRAMMAR: &str = r#"root   ::= object
value  ::= object | array | string | number | ("true" | "false" | "null") ws

object ::=
  "{" ws (
            string ":" ws value
    ("," ws string ":" ws value)*
  )? "}" ws

array  ::=
  "[" ws (
            value
    ("," ws value)*
  )? "]" ws

string ::=
  "\"" (
    [^"\\] |
    "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F])
  )* "\"" ws

number ::= ("-"? ([0-9] | [1-9] [0-9]*)) ("." [0-9]+)? ([eE] [-+]? [0-9]+)? ws

ws ::= ([ \t\n] ws)?
"#;

/// Maps one finished completion and its index to a choice.
pub type ChoiceMapper = Arc<dyn Fn(&InferenceResult, usize) -> Choice + Send + Sync>;

/// Like [`ChoiceMapper`], also given the prompt before templating.
pub type PromptChoiceMapper = Arc<dyn Fn(&InferenceResult, &str, usize) -> Choice + Send + Sync>;

/// Output of one prompt's completion fan-out.
pub struct GeneratedText {
    /// Yields the folded bundle once every started completion has finished.
    pub bundle: mpsc::Receiver<ResponseBundle>,
    /// Raw per-completion results, when requested. They must be drained for
    /// the bundle to be produced.
    pub completions: Option<Vec<mpsc::Receiver<InferenceOutcome>>>,
    /// Per-completion token streams, when requested. They must be drained as
    /// well.
    pub tokens: Option<Vec<mpsc::Receiver<InferenceResult>>>,
    pub reducer: JoinHandle<()>,
}

/// Endpoint-specific pieces of a request fan-out.
pub struct EndpointConfig {
    pub object: String,
    pub template: Option<String>,
    pub template_data: PromptTemplateData,
    pub map_choice: PromptChoiceMapper,
}

/// Output of a whole request.
pub struct GenerationStreams {
    pub response: mpsc::Receiver<AggregatedResponse>,
    /// Every completion of every prompt, merged.
    pub completions: Option<mpsc::Receiver<InferenceOutcome>>,
    /// Every token of every completion, merged.
    pub tokens: Option<mpsc::Receiver<InferenceResult>>,
}

/// Folds one completion outcome into a prompt's bundle.
pub fn fold_completion(
    policy: PartialResultPolicy,
    map_choice: &ChoiceMapper,
    outcome: InferenceOutcome,
    mut bundle: ResponseBundle,
) -> ResponseBundle {
    if bundle.is_failed() && policy == PartialResultPolicy::Discard {
        return bundle;
    }
    match outcome {
        Err(e) => {
            if policy == PartialResultPolicy::Discard {
                bundle.choices.clear();
                bundle.usage = TokenUsage::default();
            }
            bundle.error.get_or_insert(e);
        }
        Ok(result) => {
            bundle.usage.add(&result.usage);
            bundle.insert_choice(map_choice(&result, result.request.id));
        }
    }
    bundle
}

/// Folds one prompt's bundle into the request's response.
pub fn fold_bundle(
    policy: PartialResultPolicy,
    bundle: ResponseBundle,
    mut response: AggregatedResponse,
) -> AggregatedResponse {
    if response.is_failed() && policy == PartialResultPolicy::Discard {
        return response;
    }
    if let Some(e) = bundle.error {
        if policy == PartialResultPolicy::Discard {
            response.choices.clear();
            response.usage = Usage::default();
            response.error = Some(e);
            return response;
        }
        response.error.get_or_insert(e);
    }
    response.usage.add(&bundle.usage);
    response.choices.extend(bundle.choices);
    response
}

impl LlmBackendService {
    /// Generates `n` completions of `input` concurrently and folds them into
    /// one bundle.
    ///
    /// A completion whose backend cannot be resolved is skipped; the others
    /// still run. Choice indices come from each completion's slot, not from
    /// the order in which they finish.
    pub async fn generate_text(
        &self,
        input: &str,
        request: Arc<ApiRequest>,
        config: &BackendConfig,
        map_choice: ChoiceMapper,
        enable_completion_streams: bool,
        enable_token_streams: bool,
    ) -> GeneratedText {
        let n = request.completions_per_prompt();
        let images = request.images();

        let launches = (0..n).map(|id| {
            let invocation = InferenceRequest {
                id,
                text: input.to_string(),
                images: images.clone(),
            };
            self.inference(request.cancel.clone(), invocation, config, enable_token_streams)
        });
        let launched = join_all(launches).await;

        let mut results = Vec::with_capacity(n);
        let mut tokens = Vec::with_capacity(n);
        let mut start_error: Option<InferenceError> = None;
        for (id, launch) in launched.into_iter().enumerate() {
            match launch {
                Ok(streams) => {
                    results.push(streams.results);
                    tokens.extend(streams.tokens);
                }
                Err(e) => {
                    log::warn!("Skipping completion {} of {} for {}: {}", id, n, config.model, e);
                    start_error = Some(e);
                }
            }
        }

        let mut initial = ResponseBundle::new(request.clone());
        if results.is_empty() {
            initial.error = start_error;
        }

        let completions = if enable_completion_streams {
            let (to_reduce, to_expose): (Vec<_>, Vec<_>) = results.into_iter().map(tee).unzip();
            results = to_reduce;
            Some(to_expose)
        } else {
            None
        };

        let policy = self.app_config.partial_results;
        let (bundle_tx, bundle_rx) = mpsc::channel(STREAM_CAPACITY);
        let reducer = reduce(
            results,
            bundle_tx,
            move |outcome, bundle| fold_completion(policy, &map_choice, outcome, bundle),
            initial,
        );

        GeneratedText {
            bundle: bundle_rx,
            completions,
            tokens: enable_token_streams.then_some(tokens),
            reducer,
        }
    }

    /// Runs one completion fan-out per prompt string of `config` and folds
    /// their bundles into one response.
    ///
    /// Must be called from within a Tokio runtime. When notifications are
    /// requested the returned `completions`/`tokens` streams have to be
    /// drained for the response to be produced.
    pub fn generate_text_from_request<E>(
        &self,
        request: ApiRequest,
        mut config: BackendConfig,
        endpoint: E,
        notify_on_prompt_result: bool,
        notify_on_token: bool,
    ) -> GenerationStreams
    where
        E: FnOnce(&BackendConfig, &ApiRequest) -> EndpointConfig,
    {
        if request.wants_json() {
            config.grammar = Some(JSON_GRAMMAR.to_string());
        }
        if request.stream && config.prompt_strings.len() > 1 {
            log::warn!(
                "Streaming request for {} carries {} prompt strings, token streams will interleave",
                request.model,
                config.prompt_strings.len()
            );
        }

        let endpoint = endpoint(&config, &request);
        let template = match endpoint.template.clone().filter(|t| !t.is_empty()) {
            Some(template) => Some(template),
            None if self.templates.exists(&config.model) => Some(config.model.clone()),
            None => {
                log::warn!("No prompt template found for model {}", config.model);
                None
            }
        };

        let n = request.completions_per_prompt();
        let request = Arc::new(request);
        let config = Arc::new(config);

        let (completions_tx, completions_rx) = optional_channel(notify_on_prompt_result);
        let (tokens_tx, tokens_rx) = optional_channel(notify_on_token);

        let mut prompt_results = Vec::with_capacity(config.prompt_strings.len());
        for (prompt_index, prompt) in config.prompt_strings.iter().enumerate() {
            let (bundle_tx, bundle_rx) = mpsc::channel(STREAM_CAPACITY);
            prompt_results.push(bundle_rx);

            let service = self.clone();
            let request = request.clone();
            let config = config.clone();
            let template = template.clone();
            let template_data = endpoint.template_data.clone();
            let map_choice = endpoint.map_choice.clone();
            let completions_tx = completions_tx.clone();
            let tokens_tx = tokens_tx.clone();
            let prompt = prompt.clone();

            tokio::spawn(async move {
                let input = service.apply_template(template.as_deref(), &template_data, &prompt);
                let map: ChoiceMapper =
                    Arc::new(move |result: &InferenceResult, completion_index: usize| {
                        map_choice(result, &prompt, prompt_index * n + completion_index)
                    });

                let generated = service
                    .generate_text(
                        &input,
                        request,
                        &config,
                        map,
                        completions_tx.is_some(),
                        tokens_tx.is_some(),
                    )
                    .await;

                if let (Some(streams), Some(tx)) = (generated.completions, completions_tx) {
                    merge(streams, tx);
                }
                if let (Some(streams), Some(tx)) = (generated.tokens, tokens_tx) {
                    merge(streams, tx);
                }

                let mut bundle_rx = generated.bundle;
                if let Some(bundle) = bundle_rx.recv().await {
                    if bundle_tx.send(bundle).await.is_err() {
                        log::debug!("Response dropped before prompt {} finished", prompt_index);
                    }
                }
            });
        }
        drop(completions_tx);
        drop(tokens_tx);

        let policy = self.app_config.partial_results;
        let (response_tx, response_rx) = mpsc::channel(STREAM_CAPACITY);
        reduce(
            prompt_results,
            response_tx,
            move |bundle, response| fold_bundle(policy, bundle, response),
            AggregatedResponse::new(&request.model, &endpoint.object),
        );

        GenerationStreams {
            response: response_rx,
            completions: completions_rx,
            tokens: tokens_rx,
        }
    }

    /// Text completion: each prompt goes through the model's completion
    /// template.
    pub fn completion(
        &self,
        request: ApiRequest,
        config: BackendConfig,
        notify_on_prompt_result: bool,
        notify_on_token: bool,
    ) -> GenerationStreams {
        let finetuner = self.finetuner.clone();
        self.generate_text_from_request(
            request,
            config,
            |config, _| EndpointConfig {
                object: "text_completion".to_string(),
                template: config.template.completion.clone(),
                template_data: PromptTemplateData {
                    system_prompt: config.system_prompt.clone(),
                    ..PromptTemplateData::default()
                },
                map_choice: stop_choice(finetuner, config.clone()),
            },
            notify_on_prompt_result,
            notify_on_token,
        )
    }

    /// Edit: like completion, with the request's instruction available to
    /// the model's edit template.
    pub fn edit(
        &self,
        request: ApiRequest,
        config: BackendConfig,
        notify_on_prompt_result: bool,
        notify_on_token: bool,
    ) -> GenerationStreams {
        let finetuner = self.finetuner.clone();
        self.generate_text_from_request(
            request,
            config,
            |config, request| EndpointConfig {
                object: "edit".to_string(),
                template: config.template.edit.clone(),
                template_data: PromptTemplateData {
                    system_prompt: config.system_prompt.clone(),
                    instruction: request.instruction.clone().unwrap_or_default(),
                    ..PromptTemplateData::default()
                },
                map_choice: stop_choice(finetuner, config.clone()),
            },
            notify_on_prompt_result,
            notify_on_token,
        )
    }

    /// Expands `prompt` with `template`, falling back to the raw prompt.
    fn apply_template(
        &self,
        template: Option<&str>,
        common: &PromptTemplateData,
        prompt: &str,
    ) -> String {
        let Some(name) = template else {
            return prompt.to_string();
        };
        let data = PromptTemplateData {
            input: prompt.to_string(),
            ..common.clone()
        };
        match self.templates.evaluate(name, &data) {
            Ok(templated) => {
                log::debug!("Template found, input modified to: {}", templated);
                templated
            }
            Err(e) => {
                log::debug!("Template {} failed, using the raw prompt: {:#}", name, e);
                prompt.to_string()
            }
        }
    }
}

fn optional_channel<T>(enabled: bool) -> (Option<mpsc::Sender<T>>, Option<mpsc::Receiver<T>>) {
    if enabled {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    }
}

fn stop_choice(finetuner: Finetuner, config: BackendConfig) -> PromptChoiceMapper {
    Arc::new(move |result: &InferenceResult, prompt: &str, index: usize| Choice {
        index,
        finish_reason: Some("stop".to_string()),
        text: finetuner.finetune(&config, prompt, &result.text),
    })
}
