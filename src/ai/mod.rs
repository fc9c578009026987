use async_trait::async_trait;
use std::path::Path;

pub mod local_server;
pub mod response;
pub mod session;
pub mod types;
pub use response::{clean_response, strip_framing, END_OF_TURN, START_OF_TURN};
pub use session::{GenerationStream, InferenceSessionManager, InferenceState, InitOutcome};
pub use types::*;

/// A local inference runtime (llama.cpp server, an on-device runtime, ...).
/// Loads allow-listed model files and hands back model handles.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Load `model` from `path`. Called at most once per initialization.
    async fn load(&self, model: &ModelDescriptor, path: &Path)
        -> Result<Box<dyn LoadedModel>, AiError>;

    /// Engine name for logging/display
    fn name(&self) -> &str;
}

/// A loaded model. Owned exclusively by the inference session manager.
pub trait LoadedModel: Send + Sync {
    /// Open a reusable session for repeated generations.
    fn open_session(&self, options: &SessionOptions) -> Result<Box<dyn EngineSession>, AiError>;
}

/// A persistent generation session on a loaded model.
#[async_trait]
pub trait EngineSession: Send {
    /// Submit the conversation's query chunks (and image, if any) and start
    /// generating. Output arrives on the returned channel as partial results,
    /// the last one flagged `done`. Dropping the receiver cancels generation.
    async fn generate(&mut self, conversation: &ConversationBuffer) -> Result<PartialRx, AiError>;
}
