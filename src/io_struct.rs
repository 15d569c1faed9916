use crate::error::InferenceError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One backend invocation's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    /// Slot of this invocation inside its completion fan-out.
    pub id: usize,
    pub text: String,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt: u32,
    pub completion: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt = self.prompt.saturating_add(other.prompt);
        self.completion = self.completion.saturating_add(other.completion);
    }

    pub fn total(&self) -> u32 {
        self.prompt.saturating_add(self.completion)
    }
}

/// Output of one invocation: a single token while streaming, or the whole
/// completion once the invocation has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResult {
    pub request: Arc<InferenceRequest>,
    pub text: String,
    pub usage: TokenUsage,
}

pub type InferenceOutcome = Result<InferenceResult, InferenceError>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Choice {
    pub index: usize,
    pub finish_reason: Option<String>,
    pub text: String,
}

/// Every completion of one prompt, folded together.
#[derive(Debug, Clone)]
pub struct ResponseBundle {
    pub request: Arc<ApiRequest>,
    /// Sorted by `Choice::index`; failed completions leave no entry.
    pub choices: Vec<Choice>,
    pub usage: TokenUsage,
    /// Set once any completion failed. Choices and usage gathered so far are
    /// partial when this is present.
    pub error: Option<InferenceError>,
}

impl ResponseBundle {
    pub fn new(request: Arc<ApiRequest>) -> Self {
        Self {
            request,
            choices: Vec::new(),
            usage: TokenUsage::default(),
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn insert_choice(&mut self, choice: Choice) {
        let pos = self.choices.partition_point(|c| c.index <= choice.index);
        self.choices.insert(pos, choice);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, usage: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(usage.prompt);
        self.completion_tokens = self.completion_tokens.saturating_add(usage.completion);
        self.total_tokens = self.prompt_tokens.saturating_add(self.completion_tokens);
    }
}

/// The OpenAI-compatible response returned for a whole request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregatedResponse {
    pub id: String,
    pub created: i64,
    /// Echoed from the request as sent by the client.
    pub model: String,
    pub object: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    /// A failed request still carries what was gathered before the failure.
    #[serde(skip)]
    pub error: Option<InferenceError>,
}

impl AggregatedResponse {
    pub fn new(model: &str, object: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            object: object.to_string(),
            choices: Vec::new(),
            usage: Usage::default(),
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    /// Images attached to this message, already encoded for the backend.
    #[serde(default)]
    pub string_images: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

/// The parts of an OpenAI-style request the fan-out consumes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApiRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Completions per prompt; zero or absent means one.
    #[serde(default)]
    pub n: Option<usize>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    /// Free-form instruction of edit requests.
    #[serde(default)]
    pub instruction: Option<String>,

    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl ApiRequest {
    pub fn completions_per_prompt(&self) -> usize {
        self.n.unwrap_or(1).max(1)
    }

    pub fn images(&self) -> Vec<String> {
        self.messages
            .iter()
            .flat_map(|m| m.string_images.iter().cloned())
            .collect()
    }

    pub fn wants_json(&self) -> bool {
        self.response_format
            .as_ref()
            .is_some_and(|f| f.format_type == "json_object")
    }
}
