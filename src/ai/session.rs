// session.rs — Inference session lifecycle and streaming generation.
//
// The manager selects an allow-listed model, loads it once, keeps one engine
// session open, and serves one generation at a time. Each generation is
// pumped by a background task that accumulates partials, enforces the
// caller's timeout, and emits exactly one terminal event.

use futures::{FutureExt, Stream};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::time::Instant;

use super::response::{clean_response, END_OF_TURN};
use super::types::{
    AiError, ConversationBuffer, GenerationEvent, InferenceError, ModelDescriptor, PartialRx,
    PromptSpec, SessionOptions,
};
use super::{EngineSession, InferenceEngine, LoadedModel};
use crate::capture::Frame;
use crate::settings::AssetCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceState {
    Unloaded,
    ModelLoading,
    Ready,
    /// Loading failed; unloaded until the next `initialize`.
    Failed,
}

/// Result of [`InferenceSessionManager::initialize`]. `Unavailable` is an
/// expected outcome when model files haven't been provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Ready(ModelDescriptor),
    Unavailable(String),
}

struct LoadedSession {
    descriptor: ModelDescriptor,
    // Kept alive for as long as the session is.
    _model: Box<dyn LoadedModel>,
    session: Box<dyn EngineSession>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

/// Held for the lifetime of one generation; clears the busy flag on drop.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Restores `fallback` if an initialization is abandoned mid-load.
struct LoadingGuard<'a> {
    state: &'a Mutex<InferenceState>,
    fallback: InferenceState,
    armed: bool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = lock(self.state);
            if *state == InferenceState::ModelLoading {
                *state = self.fallback;
            }
        }
    }
}

/// Owns the model handle and its engine session.
///
/// Overlapping requests are rejected with [`InferenceError::Busy`]: the
/// conversation is sequential, and a request issued before the previous
/// stream ended (or was dropped) does not wait.
pub struct InferenceSessionManager {
    engine: Arc<dyn InferenceEngine>,
    catalog: Arc<dyn AssetCatalog>,
    models_dir: PathBuf,
    state: Mutex<InferenceState>,
    loaded: TokioMutex<Option<LoadedSession>>,
    busy: Arc<AtomicBool>,
}

impl InferenceSessionManager {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        catalog: Arc<dyn AssetCatalog>,
        models_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            catalog,
            models_dir: models_dir.into(),
            state: Mutex::new(InferenceState::Unloaded),
            loaded: TokioMutex::new(None),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> InferenceState {
        *lock(&self.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == InferenceState::Ready
    }

    fn set_state(&self, next: InferenceState) {
        let mut state = lock(&self.state);
        if *state != next {
            log::info!("Inference session: {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Descriptor of the loaded model, if any.
    pub async fn current_model(&self) -> Option<ModelDescriptor> {
        self.loaded.lock().await.as_ref().map(|l| l.descriptor.clone())
    }

    /// Select, load, and open a session on a model.
    ///
    /// With `model_id` only that allow-list entry is considered; otherwise
    /// image-capable models are preferred, then default-flagged ones. The
    /// first candidate whose file is present in the models directory wins.
    /// A switch that fails leaves the current model loaded and `Ready`.
    pub async fn initialize(&self, model_id: Option<&str>) -> InitOutcome {
        let mut loaded = self.loaded.lock().await;

        if let Some(current) = loaded.as_ref() {
            if model_id.map_or(true, |id| id == current.descriptor.id) {
                return InitOutcome::Ready(current.descriptor.clone());
            }
            if self.busy.load(Ordering::SeqCst) {
                return InitOutcome::Unavailable(InferenceError::Busy.to_string());
            }
        }

        let Some((descriptor, path)) = self.select_model(model_id) else {
            let reason = match model_id {
                Some(id) => format!("model {} is not allow-listed or its file is missing", id),
                None => format!("no allow-listed model file found in {}", self.models_dir.display()),
            };
            log::info!("Inference unavailable: {}", reason);
            return InitOutcome::Unavailable(reason);
        };

        // The current model keeps serving until its replacement is open.
        let fallback = match loaded.as_ref() {
            Some(current) => {
                log::info!("Switching model from {} to {}", current.descriptor.id, descriptor.id);
                InferenceState::Ready
            }
            None => InferenceState::Failed,
        };

        self.set_state(InferenceState::ModelLoading);
        let mut guard = LoadingGuard {
            state: &self.state,
            fallback,
            armed: true,
        };
        log::info!(
            "Loading model {} from {} via {}",
            descriptor.id,
            path.display(),
            self.engine.name()
        );

        let load = AssertUnwindSafe(self.engine.load(&descriptor, &path)).catch_unwind();
        let model = match load.await {
            Ok(Ok(model)) => model,
            Ok(Err(e)) => return self.load_failed(&descriptor, e, fallback),
            Err(panic) => {
                let err = AiError::Panicked(panic_message(panic));
                return self.load_failed(&descriptor, err, fallback);
            }
        };

        let options = SessionOptions {
            enable_vision: descriptor.supports_image,
            max_tokens: descriptor.max_tokens,
        };
        let session = match model.open_session(&options) {
            Ok(session) => session,
            Err(e) => return self.load_failed(&descriptor, e, fallback),
        };

        *loaded = Some(LoadedSession {
            descriptor: descriptor.clone(),
            _model: model,
            session,
        });
        guard.armed = false;
        self.set_state(InferenceState::Ready);
        log::info!("Model {} ready (vision={})", descriptor.id, options.enable_vision);
        InitOutcome::Ready(descriptor)
    }

    fn load_failed(
        &self,
        descriptor: &ModelDescriptor,
        err: AiError,
        fallback: InferenceState,
    ) -> InitOutcome {
        log::warn!("Model {} failed to load: {}", descriptor.id, err);
        self.set_state(fallback);
        InitOutcome::Unavailable(err.to_string())
    }

    fn select_model(&self, model_id: Option<&str>) -> Option<(ModelDescriptor, PathBuf)> {
        let mut candidates = self.catalog.models();
        match model_id {
            Some(id) => candidates.retain(|m| m.id == id),
            // Stable sort: allow-list order breaks ties.
            None => candidates.sort_by_key(|m| (!m.supports_image, !m.is_default)),
        }

        candidates.into_iter().find_map(|model| {
            let path = self.models_dir.join(&model.filename);
            if model_file_present(&path) {
                Some((model, path))
            } else {
                log::debug!("Model file missing for {}: {}", model.id, path.display());
                None
            }
        })
    }

    /// Answer `prompt` about `frame`. The prompt is sent as a query chunk
    /// terminated by the end-of-turn marker, the frame as an image.
    pub async fn generate_from_frame(
        &self,
        frame: Frame,
        prompt: &PromptSpec,
        timeout: Duration,
    ) -> Result<GenerationStream, InferenceError> {
        let mut conversation = ConversationBuffer::new();
        conversation.add_query_chunk(format!("{}{}", prompt.text, END_OF_TURN));
        conversation.add_image(frame);
        self.start(conversation, timeout).await
    }

    /// Apply `prompt` to `text`, no image attached.
    pub async fn generate_from_text(
        &self,
        text: &str,
        prompt: &PromptSpec,
        timeout: Duration,
    ) -> Result<GenerationStream, InferenceError> {
        let mut conversation = ConversationBuffer::new();
        conversation.add_query_chunk(format!("{}\n\n", prompt.text));
        conversation.add_query_chunk(format!("{}{}", text, END_OF_TURN));
        self.start(conversation, timeout).await
    }

    async fn start(
        &self,
        conversation: ConversationBuffer,
        timeout: Duration,
    ) -> Result<GenerationStream, InferenceError> {
        if !self.is_ready() {
            return Err(InferenceError::NoModel);
        }
        let busy = BusyGuard::acquire(&self.busy).ok_or_else(|| {
            log::warn!("Generation rejected: previous response still streaming");
            InferenceError::Busy
        })?;

        // One budget for the whole request, engine start included.
        let deadline = Instant::now() + timeout;

        let partials = {
            let mut loaded = self.loaded.lock().await;
            let current = loaded.as_mut().ok_or(InferenceError::NoModel)?;
            if conversation.image().is_some() && !current.descriptor.supports_image {
                return Err(InferenceError::ImageUnsupported(current.descriptor.id.clone()));
            }

            let generate = AssertUnwindSafe(current.session.generate(&conversation)).catch_unwind();
            match tokio::time::timeout_at(deadline, generate).await {
                Ok(Ok(Ok(rx))) => rx,
                Ok(Ok(Err(e))) => {
                    log::error!("Engine failed to start generation: {}", e);
                    return Err(InferenceError::Engine(e.to_string()));
                }
                Ok(Err(panic)) => {
                    let msg = panic_message(panic);
                    log::error!("Engine panicked starting generation: {}", msg);
                    return Err(InferenceError::Engine(msg));
                }
                Err(_) => {
                    log::warn!("Engine did not start generating within {}ms", timeout.as_millis());
                    return Err(InferenceError::Timeout(timeout));
                }
            }
        };

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(pump(partials, tx, conversation, deadline, timeout, busy));
        Ok(GenerationStream::new(rx))
    }

    /// Drop the engine session and model. Safe to call repeatedly and from
    /// any task.
    pub async fn shutdown(&self) {
        let previous = self.loaded.lock().await.take();
        if let Some(previous) = previous {
            log::info!("Unloading model {}", previous.descriptor.id);
        }
        self.set_state(InferenceState::Unloaded);
    }
}

fn model_file_present(path: &Path) -> bool {
    path.is_file()
}

enum PumpEnd {
    Finished,
    Failed(InferenceError),
    Abandoned,
}

/// Forward engine partials to the consumer and finish with one terminal event.
async fn pump(
    partials: PartialRx,
    events: mpsc::Sender<GenerationEvent>,
    mut conversation: ConversationBuffer,
    deadline: Instant,
    timeout: Duration,
    busy: BusyGuard,
) {
    let end = match tokio::time::timeout_at(deadline, drain(partials, &events, &mut conversation)).await {
        Ok(end) => end,
        Err(_) => {
            log::warn!("Generation exceeded {}ms", timeout.as_millis());
            PumpEnd::Failed(InferenceError::Timeout(timeout))
        }
    };

    let event = match end {
        PumpEnd::Finished => match clean_response(conversation.output()) {
            Some(text) => {
                log::debug!("Generation complete ({} chars)", text.len());
                GenerationEvent::Completed(text)
            }
            None => {
                log::warn!("Generation produced an empty response");
                GenerationEvent::Failed(InferenceError::EmptyResponse)
            }
        },
        PumpEnd::Failed(e) => GenerationEvent::Failed(e),
        PumpEnd::Abandoned => {
            log::info!("Generation stream dropped by consumer; cancelled");
            return;
        }
    };
    // Free the session before the consumer can observe the end of the stream.
    drop(busy);
    let _ = events.send(event).await;
}

async fn drain(
    mut partials: PartialRx,
    events: &mpsc::Sender<GenerationEvent>,
    conversation: &mut ConversationBuffer,
) -> PumpEnd {
    loop {
        let next = tokio::select! {
            next = partials.recv() => next,
            _ = events.closed() => return PumpEnd::Abandoned,
        };

        match next {
            Some(Ok(partial)) => {
                conversation.push_output(&partial.text);
                if !partial.text.is_empty()
                    && events.send(GenerationEvent::Partial(partial.text)).await.is_err()
                {
                    return PumpEnd::Abandoned;
                }
                if partial.done {
                    return PumpEnd::Finished;
                }
            }
            Some(Err(e)) => {
                log::error!("Engine error during generation: {}", e);
                return PumpEnd::Failed(InferenceError::Engine(e.to_string()));
            }
            None => {
                log::error!("Engine stream ended without a final result");
                return PumpEnd::Failed(InferenceError::Engine(
                    "engine stream ended without a final result".into(),
                ));
            }
        }
    }
}

// ── GenerationStream ────────────────────────────────────────────────────

/// Consumer side of one generation. Yields partials, then exactly one
/// `Completed`/`Failed`. Dropping it cancels the generation.
pub struct GenerationStream {
    rx: mpsc::Receiver<GenerationEvent>,
    finished: bool,
}

impl GenerationStream {
    fn new(rx: mpsc::Receiver<GenerationEvent>) -> Self {
        Self {
            rx,
            finished: false,
        }
    }

    /// Wait for the final cleaned text, discarding partials.
    pub async fn final_text(mut self) -> Result<String, InferenceError> {
        while let Some(event) = self.rx.recv().await {
            match event {
                GenerationEvent::Partial(_) => continue,
                GenerationEvent::Completed(text) => return Ok(text),
                GenerationEvent::Failed(e) => return Err(e),
            }
        }
        Err(InferenceError::Engine("generation ended without a result".into()))
    }
}

impl Stream for GenerationStream {
    type Item = GenerationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if !matches!(event, GenerationEvent::Partial(_)) {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
