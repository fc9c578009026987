// coordinator.rs — Orchestrates capture -> inference -> suggestion.
//
// On an AI key press the coordinator asks the capture manager for a fresh
// frame, hands it to the inference manager with the chosen prompt, and
// republishes the final text as a suggestion the user must accept explicitly.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::ai::{InferenceError, InferenceSessionManager, PromptSpec};
use crate::capture::{CaptureSessionManager, FrameOutcome};
use crate::settings::AssetCatalog;

/// Confidence attached to every model-produced suggestion.
pub const SUGGESTION_CONFIDENCE: f32 = 0.9;

/// Offered suggestions kept for `accept`/`dismiss`; older ones are dropped.
pub const MAX_PENDING_SUGGESTIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionSource {
    Screen,
    Text,
}

/// A suggestion offered to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub id: u64,
    pub text: String,
    pub confidence: f32,
    /// Model suggestions are never committed without the user accepting them.
    pub auto_commit: bool,
    pub source: SuggestionSource,
    pub prompt_id: String,
    /// Model that produced the text.
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SuggestionError {
    #[error("Screen capture was not permitted")]
    Denied,
    #[error("No fresh screen frame arrived in time")]
    Timeout,
    #[error("Screen capture unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("Unknown prompt: {0}")]
    UnknownPrompt(String),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns both session managers for the lifetime of the keyboard service.
pub struct SuggestionCoordinator {
    capture: Arc<CaptureSessionManager>,
    inference: Arc<InferenceSessionManager>,
    catalog: Arc<dyn AssetCatalog>,
    generation_timeout: Duration,
    next_id: Mutex<u64>,
    pending: Mutex<Vec<Suggestion>>,
}

impl SuggestionCoordinator {
    pub fn new(
        capture: Arc<CaptureSessionManager>,
        inference: Arc<InferenceSessionManager>,
        catalog: Arc<dyn AssetCatalog>,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            capture,
            inference,
            catalog,
            generation_timeout,
            next_id: Mutex::new(1),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn capture(&self) -> &Arc<CaptureSessionManager> {
        &self.capture
    }

    pub fn inference(&self) -> &Arc<InferenceSessionManager> {
        &self.inference
    }

    fn resolve_prompt(&self, prompt_id: &str) -> Result<PromptSpec, SuggestionError> {
        self.catalog
            .prompt(prompt_id)
            .ok_or_else(|| SuggestionError::UnknownPrompt(prompt_id.to_string()))
    }

    /// Screenshot the current screen and ask the model about it.
    pub async fn suggest_from_screen(&self, prompt_id: &str) -> Result<Suggestion, SuggestionError> {
        let prompt = self.resolve_prompt(prompt_id)?;
        // No point asking for consent if nothing can consume the frame.
        if !self.inference.is_ready() {
            return Err(InferenceError::NoModel.into());
        }
        match self.inference.current_model().await {
            None => return Err(InferenceError::NoModel.into()),
            Some(model) if !model.supports_image => {
                return Err(InferenceError::ImageUnsupported(model.id).into())
            }
            Some(_) => {}
        }

        let frame = match self.capture.request_frame().await {
            FrameOutcome::Frame(frame) => frame,
            FrameOutcome::Denied => return Err(SuggestionError::Denied),
            FrameOutcome::Timeout => return Err(SuggestionError::Timeout),
            FrameOutcome::Unavailable(reason) => {
                return Err(SuggestionError::CaptureUnavailable(reason))
            }
        };

        let text = self
            .inference
            .generate_from_frame(frame, &prompt, self.generation_timeout)
            .await?
            .final_text()
            .await?;
        Ok(self.publish(text, SuggestionSource::Screen, prompt_id).await)
    }

    /// Apply a prompt (e.g. a tone rewrite) to text the user typed.
    pub async fn suggest_from_text(
        &self,
        text: &str,
        prompt_id: &str,
    ) -> Result<Suggestion, SuggestionError> {
        let prompt = self.resolve_prompt(prompt_id)?;
        let text = self
            .inference
            .generate_from_text(text, &prompt, self.generation_timeout)
            .await?
            .final_text()
            .await?;
        Ok(self.publish(text, SuggestionSource::Text, prompt_id).await)
    }

    async fn publish(&self, text: String, source: SuggestionSource, prompt_id: &str) -> Suggestion {
        let id = {
            let mut next = lock(&self.next_id);
            let current = *next;
            *next += 1;
            current
        };
        let suggestion = Suggestion {
            id,
            text,
            confidence: SUGGESTION_CONFIDENCE,
            auto_commit: false,
            source,
            prompt_id: prompt_id.to_string(),
            model_id: self.inference.current_model().await.map(|m| m.id),
        };
        log::info!(
            "Suggestion {} ready ({:?}, {} chars)",
            id,
            source,
            suggestion.text.len()
        );
        let mut pending = lock(&self.pending);
        pending.push(suggestion.clone());
        if pending.len() > MAX_PENDING_SUGGESTIONS {
            let stale = pending.remove(0);
            log::debug!("Dropping unanswered suggestion {}", stale.id);
        }
        drop(pending);
        suggestion
    }

    /// Suggestions offered but not yet accepted or dismissed, oldest first.
    /// At most [`MAX_PENDING_SUGGESTIONS`] are kept.
    pub fn pending(&self) -> Vec<Suggestion> {
        lock(&self.pending).clone()
    }

    /// The user accepted a suggestion; returns it for committing.
    pub fn accept(&self, id: u64) -> Option<Suggestion> {
        self.take(id)
    }

    pub fn dismiss(&self, id: u64) -> bool {
        self.take(id).is_some()
    }

    fn take(&self, id: u64) -> Option<Suggestion> {
        let mut pending = lock(&self.pending);
        let pos = pending.iter().position(|s| s.id == id)?;
        Some(pending.remove(pos))
    }

    /// Release the capture session and unload the model.
    pub async fn shutdown(&self) {
        self.capture.release();
        self.inference.shutdown().await;
        lock(&self.pending).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggestion_serializes_camel_case() {
        let s = Suggestion {
            id: 3,
            text: "On my way!".into(),
            confidence: SUGGESTION_CONFIDENCE,
            auto_commit: false,
            source: SuggestionSource::Screen,
            prompt_id: "screen_reply".into(),
            model_id: Some("gemma-3n-e2b-it".into()),
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["autoCommit"], serde_json::json!(false));
        assert_eq!(v["source"], "screen");
        assert_eq!(v["promptId"], "screen_reply");
    }

    #[test]
    fn inference_errors_pass_through_display() {
        let err: SuggestionError = InferenceError::EmptyResponse.into();
        assert_eq!(err.to_string(), "Model returned an empty response");
    }
}
