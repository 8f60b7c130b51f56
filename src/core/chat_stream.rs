use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use memchr::memchr;
use tracing::{debug, warn};

use crate::api::{ChatRequest, ChatResponse};
use crate::core::config::data::ModelConfig;
use crate::core::message::Message;
use crate::utils::url::construct_api_url;

pub const DEFAULT_MODEL_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Request(String),
    /// The server reported an error, formatted for display.
    #[error("{0}")]
    Api(String),
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        ModelError::Request(err.to_string())
    }
}

/// Reply fragments in arrival order. Consumed once.
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

/// Language model that produces a reply for a message history.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream_chat(&self, messages: &[Message]) -> Result<ReplyStream, ModelError>;
}

/// Drains a reply stream into the complete reply text.
pub async fn collect_reply(
    client: &dyn ModelClient,
    messages: &[Message],
) -> Result<String, ModelError> {
    let mut fragments = client.stream_chat(messages).await?;
    let mut reply = String::new();
    while let Some(fragment) = fragments.next().await {
        reply.push_str(&fragment?);
    }
    Ok(reply)
}

/// Chat-completions client for OpenAI-compatible servers.
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl OpenAiCompatibleClient {
    /// Unset values fall back to `OPENAI_BASE_URL`, `OPENAI_API_KEY` and the
    /// built-in defaults.
    pub fn from_config(config: &ModelConfig, client: reqwest::Client) -> Self {
        let base_url = non_empty(config.base_url.clone())
            .or_else(|| non_empty(std::env::var("OPENAI_BASE_URL").ok()))
            .unwrap_or_else(|| DEFAULT_MODEL_BASE_URL.to_string());
        let api_key = non_empty(config.api_key.clone())
            .or_else(|| non_empty(std::env::var("OPENAI_API_KEY").ok()));
        let model = non_empty(config.model.clone()).unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Self {
            client,
            base_url,
            api_key,
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    async fn stream_chat(&self, messages: &[Message]) -> Result<ReplyStream, ModelError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: messages.iter().map(Message::to_api).collect(),
            stream: true,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let chat_url = construct_api_url(&self.base_url, "chat/completions");
        debug!(url = %chat_url, model = %self.model, messages = messages.len(), "Model request");

        let mut http_request = self
            .client
            .post(chat_url)
            .header("Content-Type", "application/json");
        if let Some(api_key) = &self.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let response = http_request.json(&request).send().await?;
        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(ModelError::Api(format_api_error(&error_text)));
        }

        let decoder = ChunkDecoder {
            body: Box::pin(response.bytes_stream()),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            finished: false,
        };
        Ok(Box::pin(stream::unfold(decoder, ChunkDecoder::next_item)))
    }
}

/// Outcome of one line of a chat-completions event stream.
#[derive(Debug, PartialEq)]
enum StreamLine {
    Skip,
    Chunk(String),
    Done,
    Error(String),
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn process_sse_line(line: &str) -> StreamLine {
    let Some(payload) = extract_data_payload(line) else {
        return StreamLine::Skip;
    };
    if payload == "[DONE]" {
        return StreamLine::Done;
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) if response.error.is_some() => StreamLine::Error(format_api_error(payload)),
        Ok(response) => response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map_or(StreamLine::Skip, StreamLine::Chunk),
        Err(_) if payload.trim().is_empty() => StreamLine::Skip,
        Err(_) => StreamLine::Error(format_api_error(payload)),
    }
}

struct ChunkDecoder<S> {
    body: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, ModelError>>,
    finished: bool,
}

impl<S, B> ChunkDecoder<S>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send,
    B: AsRef<[u8]> + Send,
{
    async fn next_item(mut self) -> Option<(Result<String, ModelError>, Self)> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some((item, self));
            }
            if self.finished {
                return None;
            }

            match self.body.next().await {
                Some(Ok(bytes)) => {
                    self.buffer.extend_from_slice(bytes.as_ref());
                    self.drain_lines();
                }
                Some(Err(err)) => {
                    self.finished = true;
                    self.pending.push_back(Err(err.into()));
                }
                None => {
                    if !self.buffer.is_empty() {
                        self.buffer.push(b'\n');
                        self.drain_lines();
                    }
                    self.finished = true;
                }
            }
        }
    }

    fn drain_lines(&mut self) {
        while !self.finished {
            let Some(newline_pos) = memchr(b'\n', &self.buffer) else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = match std::str::from_utf8(&line) {
                Ok(line) => line.trim(),
                Err(err) => {
                    warn!(error = %err, "Invalid UTF-8 in model stream");
                    continue;
                }
            };

            match process_sse_line(line) {
                StreamLine::Skip => {}
                StreamLine::Chunk(content) => self.pending.push_back(Ok(content)),
                StreamLine::Done => self.finished = true,
                StreamLine::Error(message) => {
                    self.pending.push_back(Err(ModelError::Api(message)));
                    self.finished = true;
                }
            }
        }
    }
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return "API Error: <empty>".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&json_value).filter(|s| !s.is_empty()) {
            return format!("API Error: {summary}");
        }
        return format!("API Error: {json_value}");
    }

    format!("API Error: {trimmed}")
}
