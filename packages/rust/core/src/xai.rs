//! xAI chat-completions generator.
//!
//! Speaks the OpenAI-compatible `/chat/completions` API. The message list is
//! the system prompt (prompt file contents followed by one `key: value` line
//! per scope entry), then one user/assistant pair per history entry, then the
//! new question.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use parley_shared::{GeneratorConfig, ParleyError, Result};

use crate::generator::{FragmentCoalescer, GenerationRequest, Generator};

const USER_AGENT: &str = concat!("parley/", env!("CARGO_PKG_VERSION"));

/// Generator backed by the xAI API.
///
/// Holds a blocking HTTP client, so it must be built and dropped outside an
/// async context (the server builds it on the blocking pool).
#[derive(Debug, Clone)]
pub struct XaiGenerator {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
    system_prompt: String,
    min_fragment_bytes: usize,
}

impl XaiGenerator {
    /// Read the API key from the configured env var and load the prompt file.
    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                ParleyError::config(format!(
                    "generator API key not found in {}",
                    config.api_key_env
                ))
            })?;

        let system_prompt = match &config.system_prompt_path {
            Some(path) => {
                let path = PathBuf::from(path);
                std::fs::read_to_string(&path).map_err(|e| ParleyError::io(&path, e))?
            }
            None => String::new(),
        };

        Self::new(api_key, config, system_prompt)
    }

    fn new(api_key: String, config: &GeneratorConfig, system_prompt: String) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            api_key,
            model: config.model.clone(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            system_prompt,
            min_fragment_bytes: config.min_fragment_bytes,
        })
    }

    fn messages<'a>(&'a self, request: &'a GenerationRequest) -> Vec<ChatMessage<'a>> {
        let mut system = format!("{}\n", self.system_prompt);
        for (key, value) in request.scope.entries() {
            system.push_str(&format!("\n{key}: {value}"));
        }

        let mut messages = Vec::with_capacity(request.history.len() * 2 + 2);
        messages.push(ChatMessage::owned("system", system));
        for entry in request.history.entries() {
            messages.push(ChatMessage::borrowed("user", &entry.question));
            messages.push(ChatMessage::borrowed("assistant", &entry.answer));
        }
        messages.push(ChatMessage::borrowed("user", &request.question));
        messages
    }

    fn send(&self, request: &GenerationRequest, stream: bool) -> Result<Response> {
        let body = CompletionRequest {
            model: &self.model,
            messages: self.messages(request),
            stream,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| ParleyError::generation(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(ParleyError::generation(format!(
                "{}: HTTP {status}: {}",
                self.endpoint,
                detail.trim()
            )));
        }
        Ok(response)
    }
}

impl Generator for XaiGenerator {
    #[instrument(skip_all, fields(model = %self.model, turns = request.history.len()))]
    fn stream(&self, request: &GenerationRequest, emit: &mut dyn FnMut(String)) -> Result<()> {
        let response = self.send(request, true)?;
        let chunks = relay_stream(BufReader::new(response), self.min_fragment_bytes, emit)?;
        debug!(chunks, "completion stream ended");
        Ok(())
    }

    #[instrument(skip_all, fields(model = %self.model, turns = request.history.len()))]
    fn answer(&self, request: &GenerationRequest) -> Result<String> {
        let response: CompletionResponse = self
            .send(request, false)?
            .json()
            .map_err(|e| ParleyError::generation(format!("invalid completion response: {e}")))?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ParleyError::generation("completion response had no content"))
    }
}

/// Build the shared HTTP client. No request timeout: a slow completion is
/// waited out.
fn build_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(None::<Duration>)
        .build()
        .map_err(|e| ParleyError::generation(format!("failed to build HTTP client: {e}")))
}

// ---------------------------------------------------------------------------
// Stream relay
// ---------------------------------------------------------------------------

/// Feed upstream deltas through a coalescer into `emit`; returns the number
/// of deltas seen. Buffered text is flushed even when the stream breaks off.
fn relay_stream(
    reader: impl BufRead,
    min_fragment_bytes: usize,
    emit: &mut dyn FnMut(String),
) -> Result<usize> {
    let mut coalescer = FragmentCoalescer::new(min_fragment_bytes);
    let relayed = read_deltas(reader, &mut coalescer, emit);
    coalescer.finish(emit);
    relayed
}

fn read_deltas(
    reader: impl BufRead,
    coalescer: &mut FragmentCoalescer,
    emit: &mut dyn FnMut(String),
) -> Result<usize> {
    let mut chunks = 0usize;
    for line in reader.lines() {
        let line = line.map_err(|e| ParleyError::generation(format!("stream read failed: {e}")))?;
        match parse_stream_line(&line)? {
            StreamLine::Delta(text) => {
                chunks += 1;
                coalescer.push(&text, emit);
            }
            StreamLine::Done => break,
            StreamLine::Skip => {}
        }
    }
    Ok(chunks)
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct ChatMessage<'a> {
    role: &'static str,
    content: std::borrow::Cow<'a, str>,
}

impl<'a> ChatMessage<'a> {
    fn owned(role: &'static str, content: String) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    fn borrowed(role: &'static str, content: &'a str) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseContent,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    content: Option<String>,
}

/// One line of the upstream event stream, classified.
#[derive(Debug, PartialEq, Eq)]
enum StreamLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_stream_line(line: &str) -> Result<StreamLine> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(StreamLine::Skip);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(StreamLine::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| ParleyError::generation(format!("invalid stream chunk: {e}")))?;

    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .unwrap_or_default();

    if text.is_empty() {
        Ok(StreamLine::Skip)
    } else {
        Ok(StreamLine::Delta(text))
    }
}
