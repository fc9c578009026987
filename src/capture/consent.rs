// consent.rs — The one-time "may I capture the screen?" round-trip.
//
// The host platform shows the permission dialog; we only see a single-shot
// answer. `ConsentBridge` turns that into a future: each request hands the host
// a `ConsentPrompt` carrying a oneshot responder.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// Opaque grant returned by the platform. The surface factory needs it to
/// open a capture surface; nothing else looks inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentToken(String);

impl ConsentToken {
    pub fn new(grant: impl Into<String>) -> Self {
        Self(grant.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Answer to a consent request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentOutcome {
    Granted(ConsentToken),
    Denied,
}

/// Source of capture consent. Called at most once per capture session.
#[async_trait]
pub trait ConsentProvider: Send + Sync {
    async fn request_consent(&self) -> ConsentOutcome;
}

/// Grants immediately. For desktop hosts, which have no consent dialog.
pub struct AutoConsent;

#[async_trait]
impl ConsentProvider for AutoConsent {
    async fn request_consent(&self) -> ConsentOutcome {
        ConsentOutcome::Granted(ConsentToken::new("auto"))
    }
}

// ── Channel bridge to the host UI ───────────────────────────────────────

/// A pending consent request delivered to the host. Answer it exactly once;
/// dropping it unanswered counts as a denial.
#[derive(Debug)]
pub struct ConsentPrompt {
    responder: oneshot::Sender<ConsentOutcome>,
}

impl ConsentPrompt {
    pub fn approve(self, token: ConsentToken) {
        let _ = self.responder.send(ConsentOutcome::Granted(token));
    }

    pub fn deny(self) {
        let _ = self.responder.send(ConsentOutcome::Denied);
    }
}

/// [`ConsentProvider`] that forwards each request to the host over a channel.
pub struct ConsentBridge {
    prompts: mpsc::Sender<ConsentPrompt>,
}

impl ConsentBridge {
    /// Create the bridge plus the receiver the host listens on.
    pub fn new() -> (Self, mpsc::Receiver<ConsentPrompt>) {
        let (tx, rx) = mpsc::channel(4);
        (Self { prompts: tx }, rx)
    }
}

#[async_trait]
impl ConsentProvider for ConsentBridge {
    async fn request_consent(&self) -> ConsentOutcome {
        let (tx, rx) = oneshot::channel();
        if self.prompts.send(ConsentPrompt { responder: tx }).await.is_err() {
            log::warn!("Consent host is gone; treating request as denied");
            return ConsentOutcome::Denied;
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                log::info!("Consent prompt dropped without an answer");
                ConsentOutcome::Denied
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn auto_consent_always_grants() {
        assert!(matches!(
            AutoConsent.request_consent().await,
            ConsentOutcome::Granted(_)
        ));
    }

    #[tokio::test]
    async fn bridge_delivers_host_answer() {
        let (bridge, mut prompts) = ConsentBridge::new();
        tokio::spawn(async move {
            let prompt = prompts.recv().await.unwrap();
            prompt.approve(ConsentToken::new("grant-1"));
        });
        assert_eq!(
            bridge.request_consent().await,
            ConsentOutcome::Granted(ConsentToken::new("grant-1"))
        );
    }

    #[tokio::test]
    async fn dropped_prompt_counts_as_denial() {
        let (bridge, mut prompts) = ConsentBridge::new();
        tokio::spawn(async move {
            let _ = prompts.recv().await;
        });
        assert_eq!(bridge.request_consent().await, ConsentOutcome::Denied);
    }

    #[tokio::test]
    async fn missing_host_counts_as_denial() {
        let (bridge, prompts) = ConsentBridge::new();
        drop(prompts);
        assert_eq!(bridge.request_consent().await, ConsentOutcome::Denied);
    }
}
