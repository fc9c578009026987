//! Mock inference engine and helpers shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use keysight_lib::ai::{
    AiError, ConversationBuffer, EngineSession, InferenceEngine, LoadedModel, ModelDescriptor,
    PartialResult, PartialRx, SessionOptions,
};
use keysight_lib::Settings;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// What the mock engine does on the next `generate`.
#[derive(Debug, Clone)]
pub enum Script {
    /// Stream these pieces, the last one flagged done.
    Reply(Vec<String>),
    /// Accept the request and never produce anything.
    Hang,
    /// Never return from `generate` (a server that accepts the connection
    /// but never answers).
    HangStart,
    /// Fail mid-stream after accepting the request.
    StreamError(String),
    /// Refuse to start generating.
    StartError(String),
    /// Close the channel without a final piece.
    Truncate,
}

impl Script {
    pub fn reply(pieces: &[&str]) -> Self {
        Script::Reply(pieces.iter().map(|s| s.to_string()).collect())
    }
}

#[derive(Default)]
pub struct EngineLog {
    pub loads: AtomicUsize,
    pub sessions_opened: AtomicUsize,
    pub generates: AtomicUsize,
    pub last_options: Mutex<Option<SessionOptions>>,
    pub last_conversation: Mutex<Option<ConversationBuffer>>,
    /// Senders kept alive for `Script::Hang`.
    held: Mutex<Vec<mpsc::Sender<Result<PartialResult, AiError>>>>,
}

pub struct MockEngine {
    pub log: Arc<EngineLog>,
    pub script: Arc<Mutex<Script>>,
    pub fail_load: bool,
}

impl MockEngine {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(EngineLog::default()),
            script: Arc::new(Mutex::new(script)),
            fail_load: false,
        })
    }

    pub fn failing_load() -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(EngineLog::default()),
            script: Arc::new(Mutex::new(Script::Hang)),
            fail_load: true,
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn loads(&self) -> usize {
        self.log.loads.load(Ordering::SeqCst)
    }

    pub fn generates(&self) -> usize {
        self.log.generates.load(Ordering::SeqCst)
    }

    pub fn last_conversation(&self) -> ConversationBuffer {
        self.log
            .last_conversation
            .lock()
            .unwrap()
            .clone()
            .expect("a generation was started")
    }
}

#[async_trait]
impl InferenceEngine for MockEngine {
    async fn load(
        &self,
        model: &ModelDescriptor,
        path: &Path,
    ) -> Result<Box<dyn LoadedModel>, AiError> {
        self.log.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load {
            return Err(AiError::LoadFailed(format!("{} is corrupt", path.display())));
        }
        assert!(path.ends_with(&model.filename));
        Ok(Box::new(MockModel {
            log: Arc::clone(&self.log),
            script: Arc::clone(&self.script),
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct MockModel {
    log: Arc<EngineLog>,
    script: Arc<Mutex<Script>>,
}

impl LoadedModel for MockModel {
    fn open_session(&self, options: &SessionOptions) -> Result<Box<dyn EngineSession>, AiError> {
        self.log.sessions_opened.fetch_add(1, Ordering::SeqCst);
        *self.log.last_options.lock().unwrap() = Some(options.clone());
        Ok(Box::new(MockSession {
            log: Arc::clone(&self.log),
            script: Arc::clone(&self.script),
        }))
    }
}

struct MockSession {
    log: Arc<EngineLog>,
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl EngineSession for MockSession {
    async fn generate(&mut self, conversation: &ConversationBuffer) -> Result<PartialRx, AiError> {
        self.log.generates.fetch_add(1, Ordering::SeqCst);
        *self.log.last_conversation.lock().unwrap() = Some(conversation.clone());

        let script = self.script.lock().unwrap().clone();
        let (tx, rx) = mpsc::channel(8);
        match script {
            Script::Reply(pieces) => {
                tokio::spawn(async move {
                    let n = pieces.len();
                    for (i, piece) in pieces.into_iter().enumerate() {
                        let partial = if i + 1 == n {
                            PartialResult::last(piece)
                        } else {
                            PartialResult::partial(piece)
                        };
                        if tx.send(Ok(partial)).await.is_err() {
                            return;
                        }
                    }
                    if n == 0 {
                        let _ = tx.send(Ok(PartialResult::last(""))).await;
                    }
                });
            }
            Script::Hang => self.log.held.lock().unwrap().push(tx),
            Script::HangStart => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Script::StreamError(msg) => {
                tokio::spawn(async move {
                    let _ = tx.send(Ok(PartialResult::partial("Hel"))).await;
                    let _ = tx.send(Err(AiError::ModelError(msg))).await;
                });
            }
            Script::StartError(msg) => return Err(AiError::ConnectionError(msg)),
            Script::Truncate => drop(tx),
        }
        Ok(rx)
    }
}

/// Model list with one vision model and one text-only model.
pub fn test_settings(models_dir: PathBuf) -> Settings {
    Settings {
        models_dir,
        models: vec![
            ModelDescriptor {
                id: "text-small".into(),
                filename: "text-small.bin".into(),
                max_tokens: 256,
                max_memory_mb: None,
                supports_image: false,
                is_default: true,
            },
            ModelDescriptor {
                id: "vision-large".into(),
                filename: "vision-large.bin".into(),
                max_tokens: 1024,
                max_memory_mb: Some(3072),
                supports_image: true,
                is_default: false,
            },
        ],
        ..Settings::default()
    }
}

/// Fresh scratch directory holding the named (empty) model files.
pub fn models_dir(test: &str, files: &[&str]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("keysight-{}-{}", test, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    for f in files {
        std::fs::write(dir.join(f), b"weights").unwrap();
    }
    dir
}
