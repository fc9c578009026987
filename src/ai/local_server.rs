// local_server.rs — Engine backed by a local OpenAI-compatible inference
// server (llama.cpp `llama-server` and friends), streamed over SSE.
//
// "Loading" asks the server which models it serves and checks the
// allow-listed file is among them; generation posts a streaming
// chat-completions request and forwards deltas as partial results.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

use super::response::END_OF_TURN;
use super::{
    AiError, ConversationBuffer, EngineSession, InferenceEngine, LoadedModel, ModelDescriptor,
    PartialResult, PartialRx, SessionOptions,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LocalServerEngine {
    endpoint: String,
    client: Client,
    /// Frames wider than this are downscaled before upload.
    image_max_width: u32,
    jpeg_quality: u8,
}

impl LocalServerEngine {
    pub fn new(endpoint: impl Into<String>, image_max_width: u32, jpeg_quality: u8) -> Self {
        // Generation deadlines are the caller's; this only bounds dead endpoints.
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("HTTP client config rejected ({}); using defaults", e);
                Client::new()
            });
        Self {
            endpoint: endpoint.into(),
            client,
            image_max_width,
            jpeg_quality,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }
}

/// Whether a server-reported model id refers to this allow-list entry.
/// llama.cpp reports the path it was started with, others the bare name.
fn serves_model(served_id: &str, model: &ModelDescriptor) -> bool {
    served_id == model.id
        || served_id == model.filename
        || Path::new(served_id)
            .file_name()
            .is_some_and(|name| name == model.filename.as_str())
}

#[async_trait]
impl InferenceEngine for LocalServerEngine {
    async fn load(
        &self,
        model: &ModelDescriptor,
        path: &Path,
    ) -> Result<Box<dyn LoadedModel>, AiError> {
        let response = self
            .client
            .get(self.url("/v1/models"))
            .send()
            .await
            .map_err(|e| AiError::ConnectionError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AiError::LoadFailed(format!("HTTP {} listing models", status)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AiError::InvalidResponse(e.to_string()))?;
        let served: Vec<&str> = body
            .get("data")
            .and_then(|d| d.as_array())
            .map(|models| models.iter().filter_map(|m| m.get("id")?.as_str()).collect())
            .unwrap_or_default();

        // An empty list means the server doesn't report; trust the file.
        if !served.is_empty() && !served.iter().any(|id| serves_model(id, model)) {
            return Err(AiError::LoadFailed(format!(
                "server at {} does not serve {} (serving: {})",
                self.endpoint,
                path.display(),
                served.join(", ")
            )));
        }

        log::info!("Local server at {} serves {}", self.endpoint, model.id);
        Ok(Box::new(LocalServerModel {
            client: self.client.clone(),
            url: self.url("/v1/chat/completions"),
            model_id: model.id.clone(),
            image_max_width: self.image_max_width,
            jpeg_quality: self.jpeg_quality,
        }))
    }

    fn name(&self) -> &str {
        "local-server"
    }
}

struct LocalServerModel {
    client: Client,
    url: String,
    model_id: String,
    image_max_width: u32,
    jpeg_quality: u8,
}

impl LoadedModel for LocalServerModel {
    fn open_session(&self, options: &SessionOptions) -> Result<Box<dyn EngineSession>, AiError> {
        Ok(Box::new(LocalServerSession {
            client: self.client.clone(),
            url: self.url.clone(),
            model_id: self.model_id.clone(),
            options: options.clone(),
            image_max_width: self.image_max_width,
            jpeg_quality: self.jpeg_quality,
        }))
    }
}

pub struct LocalServerSession {
    client: Client,
    url: String,
    model_id: String,
    options: SessionOptions,
    image_max_width: u32,
    jpeg_quality: u8,
}

impl LocalServerSession {
    fn build_request_body(&self, conversation: &ConversationBuffer) -> Result<Value, AiError> {
        // The server applies the chat template itself, so the turn marker
        // terminating our query is dropped here.
        let text: String = conversation.query_chunks().concat();
        let text = text.trim_end().trim_end_matches(END_OF_TURN).trim_end();

        let mut content = vec![json!({ "type": "text", "text": text })];

        if let Some(frame) = conversation.image() {
            if !self.options.enable_vision {
                return Err(AiError::ModelError(format!(
                    "session for {} was opened without vision",
                    self.model_id
                )));
            }
            let b64 = frame
                .to_jpeg_base64(self.image_max_width, self.jpeg_quality)
                .map_err(|e| AiError::ModelError(e.to_string()))?;
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/jpeg;base64,{}", b64) }
            }));
        }

        Ok(json!({
            "model": self.model_id,
            "stream": true,
            "max_tokens": self.options.max_tokens,
            "messages": [
                { "role": "user", "content": content }
            ]
        }))
    }
}

#[async_trait]
impl EngineSession for LocalServerSession {
    async fn generate(&mut self, conversation: &ConversationBuffer) -> Result<PartialRx, AiError> {
        let body = self.build_request_body(conversation)?;

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AiError::ConnectionError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".into());
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(AiError::AuthError(error_body));
            }
            if status.as_u16() == 429 {
                return Err(AiError::RateLimited {
                    retry_after_ms: 1000,
                });
            }
            return Err(AiError::ConnectionError(format!(
                "HTTP {}: {}",
                status, error_body
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(read_sse(response, tx));
        Ok(rx)
    }
}

// ── SSE parsing ─────────────────────────────────────────────────────────

/// Parse result for a single SSE `data:` payload of a chat-completions stream.
#[derive(Debug)]
enum ParseResult {
    Delta(String),
    /// A `finish_reason` arrived, possibly with a last piece of text.
    Finished(String),
    Done,
    Skip,
    Error(AiError),
}

fn parse_sse_data(data: &str) -> ParseResult {
    let trimmed = data.trim();
    if trimmed == "[DONE]" {
        return ParseResult::Done;
    }

    let parsed: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            return ParseResult::Error(AiError::InvalidResponse(format!(
                "Invalid JSON in SSE: {}",
                e
            )));
        }
    };

    if let Some(err) = parsed.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown server error");
        return ParseResult::Error(AiError::ModelError(message.to_string()));
    }

    let choice = match parsed.pointer("/choices/0") {
        Some(c) => c,
        None => return ParseResult::Skip,
    };
    let delta = choice
        .pointer("/delta/content")
        .and_then(|d| d.as_str())
        .unwrap_or("")
        .to_string();
    let finished = choice
        .get("finish_reason")
        .is_some_and(|r| !r.is_null());

    match (finished, delta.is_empty()) {
        (true, _) => ParseResult::Finished(delta),
        (false, false) => ParseResult::Delta(delta),
        (false, true) => ParseResult::Skip,
    }
}

/// Byte buffer that yields complete SSE lines. Text is only decoded once a
/// whole line has arrived, so a character split across HTTP chunks survives.
#[derive(Debug, Default)]
struct SseLines {
    pending: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<Result<String, AiError>> {
        let newline_pos = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=newline_pos).collect();
        let line = &raw[..newline_pos];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Some(
            std::str::from_utf8(line)
                .map(str::to_string)
                .map_err(|e| AiError::InvalidResponse(format!("Non-UTF-8 SSE line: {}", e))),
        )
    }
}

/// Read the response body line by line and forward partials until the
/// stream finishes or the receiver goes away.
async fn read_sse(mut response: reqwest::Response, tx: mpsc::Sender<Result<PartialResult, AiError>>) {
    let mut lines = SseLines::default();

    loop {
        while let Some(line) = lines.next_line() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let Some(data) = line.strip_prefix("data:") else {
                // Skip non-data SSE lines (comments, event:, id:, retry:)
                continue;
            };

            let item = match parse_sse_data(data) {
                ParseResult::Delta(text) => Ok(PartialResult::partial(text)),
                ParseResult::Finished(text) => {
                    let _ = tx.send(Ok(PartialResult::last(text))).await;
                    return;
                }
                ParseResult::Done => {
                    let _ = tx.send(Ok(PartialResult::last(""))).await;
                    return;
                }
                ParseResult::Skip => continue,
                ParseResult::Error(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            if tx.send(item).await.is_err() {
                log::debug!("Generation receiver dropped; closing server stream");
                return;
            }
        }

        match response.chunk().await {
            Ok(Some(bytes)) => lines.push(&bytes),
            Ok(None) => {
                // Stream ended without an explicit finish; treat what we have as final.
                let _ = tx.send(Ok(PartialResult::last(""))).await;
                return;
            }
            Err(e) => {
                let _ = tx
                    .send(Err(AiError::ConnectionError(format!(
                        "Stream read error: {}",
                        e
                    ))))
                    .await;
                return;
            }
        }
    }
}
