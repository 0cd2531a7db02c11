//! Language models that stream answer text.
//!
//! A [`LanguageModel`] turns a [`Prompt`] into a [`TokenStream`] of text
//! deltas. Streams are lazy, finite and not restartable; dropping one
//! abandons the upstream request.
//!
//! | Provider | Model |
//! |----------|-------|
//! | `openai` | [`OpenAIChatModel`]: streaming chat completions over SSE |
//! | `extractive` | [`ExtractiveModel`]: offline answer built from the grounding passages |
//! | `disabled` | [`DisabledModel`] |

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::GenerationError;
use crate::models::{ChatMessage, Role};

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// One grounding document as handed to a model.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub title: String,
    pub author: String,
    pub year: Option<i32>,
    pub excerpt: String,
}

/// Everything a model needs for one answer.
#[derive(Debug, Clone)]
pub struct Prompt {
    /// System message first, then the user/assistant history.
    pub messages: Vec<ChatMessage>,
    pub passages: Vec<Passage>,
    /// The latest user turn.
    pub question: String,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(&self, prompt: Prompt) -> Result<TokenStream, GenerationError>;
}

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn stream(&self, _prompt: Prompt) -> Result<TokenStream, GenerationError> {
        Err(GenerationError::Disabled)
    }
}

/// Offline model: answers from the best passage without any network call.
///
/// Output is deterministic and streamed one word at a time.
pub struct ExtractiveModel;

impl ExtractiveModel {
    pub fn compose(prompt: &Prompt) -> String {
        let Some(first) = prompt.passages.first() else {
            return "No relevant documents found in the knowledge base.".to_string();
        };
        let mut excerpt: String = first.excerpt.chars().take(300).collect();
        if excerpt.len() < first.excerpt.len() {
            excerpt.push_str("...");
        }
        format!(
            "I found {} relevant documents about '{}'. The most relevant document is: '{}' by {}.\n\nExcerpt: {}",
            prompt.passages.len(),
            prompt.question,
            first.title,
            first.author,
            excerpt
        )
    }
}

#[async_trait]
impl LanguageModel for ExtractiveModel {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn stream(&self, prompt: Prompt) -> Result<TokenStream, GenerationError> {
        let answer = Self::compose(&prompt);
        Ok(Box::pin(stream::iter(split_keeping_whitespace(&answer)).map(Ok)))
    }
}

/// Split into words, each carrying its trailing whitespace, so the pieces
/// concatenate back to the input.
fn split_keeping_whitespace(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_space = false;
    for c in text.chars() {
        if !c.is_whitespace() && in_space {
            out.push(std::mem::take(&mut current));
            in_space = false;
        }
        if c.is_whitespace() {
            in_space = true;
        }
        current.push(c);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Streaming chat completions against an OpenAI-compatible endpoint.
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIChatModel {
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    max_tokens: Option<u32>,
    client: reqwest::Client,
    max_retries: u32,
}

impl OpenAIChatModel {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: config.model.clone(),
            url,
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
            max_retries: 3,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamFailure>,
}

#[derive(Debug, Deserialize)]
struct StreamFailure {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[async_trait]
impl LanguageModel for OpenAIChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, prompt: Prompt) -> Result<TokenStream, GenerationError> {
        let messages: Vec<serde_json::Value> = prompt
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect();
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": true,
        });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        let request = self
            .client
            .post(format!("{}/chat/completions", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }
            let Some(req) = request.try_clone() else {
                return Err(GenerationError::Request(
                    "request body cannot be retried".to_string(),
                ));
            };
            match req.send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(parse_sse(response.bytes_stream()));
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    let err = GenerationError::Request(format!("API error {}: {}", status, text));
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => last_err = Some(GenerationError::Request(e.to_string())),
            }
        }
        Err(last_err.unwrap_or_else(|| GenerationError::Request("request failed after retries".to_string())))
    }
}

struct SseState<S> {
    body: Pin<Box<S>>,
    buffer: Vec<u8>,
    ready: VecDeque<Result<String, GenerationError>>,
    done: bool,
}

/// Decode an OpenAI-style server-sent event body into content deltas.
///
/// Lines are buffered across network chunks; `data: [DONE]` ends the stream.
/// An `error` event, or a body that ends before `[DONE]`, ends it with an
/// error item so a truncated answer is never mistaken for a complete one.
pub fn parse_sse<S, E>(body: S) -> TokenStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = SseState {
        body: Box::pin(body),
        buffer: Vec::new(),
        ready: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    drain_lines(&mut state);
                }
                Some(Err(e)) => {
                    state.done = true;
                    state.ready.push_back(Err(GenerationError::Stream(e.to_string())));
                }
                None => {
                    state.buffer.push(b'\n');
                    drain_lines(&mut state);
                    if !state.done {
                        state.ready.push_back(Err(GenerationError::Stream(
                            "stream ended before completion".to_string(),
                        )));
                    }
                    state.done = true;
                }
            }
        }
    }))
}

fn drain_lines<S>(state: &mut SseState<S>) {
    while let Some(pos) = state.buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = state.buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        let line = line.trim();

        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            state.done = true;
            state.buffer.clear();
            return;
        }
        match serde_json::from_str::<StreamChunk>(data) {
            Ok(StreamChunk {
                error: Some(failure),
                ..
            }) => {
                let message = failure
                    .message
                    .unwrap_or_else(|| "model reported an error".to_string());
                state.ready.push_back(Err(GenerationError::Stream(message)));
                state.done = true;
                state.buffer.clear();
                return;
            }
            Ok(chunk) => {
                let content = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                    .filter(|c| !c.is_empty());
                if let Some(content) = content {
                    state.ready.push_back(Ok(content));
                }
            }
            Err(e) => tracing::debug!(error = %e, data, "skipping unparseable stream event"),
        }
    }
}

/// Create the [`LanguageModel`] named by `config.provider`.
pub fn create_model(config: &GenerationConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "extractive" => Ok(Arc::new(ExtractiveModel)),
        "openai" => Ok(Arc::new(OpenAIChatModel::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

/// Keep only the turns a model should see as history.
pub fn conversation_turns(messages: &[ChatMessage]) -> impl Iterator<Item = &ChatMessage> {
    messages
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
}
