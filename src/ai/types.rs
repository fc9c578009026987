use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::capture::Frame;

/// Type alias for the channel an engine streams partial output on.
pub type PartialRx = mpsc::Receiver<Result<PartialResult, AiError>>;

/// Error type for engine-level operations
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("Connection failed: {0}")]
    ConnectionError(String),
    #[error("Authentication failed: {0}")]
    AuthError(String),
    #[error("Rate limited - retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("Model error: {0}")]
    ModelError(String),
    #[error("Model failed to load: {0}")]
    LoadFailed(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Engine panicked: {0}")]
    Panicked(String),
}

/// Errors reported to callers of the inference session manager. Always values,
/// never raw engine failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InferenceError {
    #[error("No model available")]
    NoModel,
    #[error("A generation is already in progress")]
    Busy,
    #[error("Model {0} does not accept image input")]
    ImageUnsupported(String),
    #[error("Inference failed: {0}")]
    Engine(String),
    #[error("Model returned an empty response")]
    EmptyResponse,
    #[error("Generation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

/// One allow-listed model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: String,
    /// File name inside the models directory.
    pub filename: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u32>,
    #[serde(default)]
    pub supports_image: bool,
    #[serde(default)]
    pub is_default: bool,
}

fn default_max_tokens() -> u32 {
    1024
}

/// A prompt identifier with its resolved text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSpec {
    pub id: String,
    pub text: String,
}

impl PromptSpec {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Options used when opening an engine session on a loaded model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub enable_vision: bool,
    pub max_tokens: u32,
}

/// One streamed piece of model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialResult {
    pub text: String,
    /// Set on the last piece of a response.
    pub done: bool,
}

impl PartialResult {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
        }
    }

    pub fn last(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: true,
        }
    }
}

/// Per-request conversation state: what was asked, the optional screenshot,
/// and the output streamed back so far.
#[derive(Debug, Clone, Default)]
pub struct ConversationBuffer {
    query_chunks: Vec<String>,
    image: Option<Frame>,
    output: String,
}

impl ConversationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_query_chunk(&mut self, chunk: impl Into<String>) {
        self.query_chunks.push(chunk.into());
    }

    pub fn add_image(&mut self, frame: Frame) {
        self.image = Some(frame);
    }

    pub fn push_output(&mut self, text: &str) {
        self.output.push_str(text);
    }

    pub fn query_chunks(&self) -> &[String] {
        &self.query_chunks
    }

    pub fn image(&self) -> Option<&Frame> {
        self.image.as_ref()
    }

    pub fn output(&self) -> &str {
        &self.output
    }
}

/// Events delivered to the consumer of a generation. Exactly one
/// `Completed` or `Failed` ends every stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    /// Raw text as the engine produced it.
    Partial(String),
    /// Final text, framing markers stripped and trimmed.
    Completed(String),
    Failed(InferenceError),
}
