//! LLM collaborator abstraction.
//!
//! The [`ChatClient`] trait decouples the gateway from the model transport.
//! [`ProcessChatClient`] shells out to a configured command that speaks JSON
//! on stdin/stdout; tests use scripted clients that never spawn processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::role::AgentRole;
use crate::error::CollaboratorError;
use crate::io::config::LlmConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout, run_command_with_transcript};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Identifiers attached to every request for log correlation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIds {
    pub run_id: String,
    pub task_id: Option<u64>,
    pub milestone_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub agent_role: AgentRole,
    pub messages: Vec<ChatMessage>,
    pub correlation: CorrelationIds,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Option<Usage>,
}

/// Incremental output of a streaming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Text(String),
    End,
}

pub type ChunkStream = Box<dyn Iterator<Item = Result<StreamChunk, CollaboratorError>> + Send>;

/// Request/response and streaming access to the model.
pub trait ChatClient: Send + Sync {
    fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, CollaboratorError>;
    fn stream(&self, request: &ChatRequest) -> Result<ChunkStream, CollaboratorError>;
}

/// Concatenate text chunks up to the end marker.
pub fn collect_stream(stream: ChunkStream) -> Result<String, CollaboratorError> {
    let mut text = String::new();
    for chunk in stream {
        match chunk? {
            StreamChunk::Text(piece) => text.push_str(&piece),
            StreamChunk::End => return Ok(text),
        }
    }
    Err(CollaboratorError::Transport(format!(
        "stream ended without end marker after {} bytes",
        text.len()
    )))
}

/// Collaborator backed by an external command.
///
/// The command receives the request as JSON on stdin. For `chat` it prints a
/// JSON reply (`{"content": ..., "usage": ...}` or a message with content
/// blocks) or plain text; for `stream` it prints server-sent `data:` lines.
#[derive(Debug, Clone)]
pub struct ProcessChatClient {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    transcript_dir: Option<PathBuf>,
}

impl ProcessChatClient {
    pub fn new(cfg: &LlmConfig, transcript_dir: Option<PathBuf>) -> Self {
        Self {
            command: cfg.command.clone(),
            timeout: cfg.timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
            transcript_dir,
        }
    }

    fn spawn(&self, request: &ChatRequest, stream: bool) -> Result<CommandOutput, CollaboratorError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| CollaboratorError::Transport("llm.command is empty".to_string()))?;
        let payload = json!({
            "model": request.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": stream,
            "messages": request.messages,
            "metadata": {
                "agent_role": request.agent_role,
                "run_id": request.correlation.run_id,
                "task_id": request.correlation.task_id,
                "milestone_id": request.correlation.milestone_id,
            },
        });
        let stdin = serde_json::to_vec(&payload)
            .map_err(|e| CollaboratorError::Transport(format!("serialize request: {e}")))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        let transcript = self.transcript_dir.as_ref().map(|dir| {
            dir.join(format!(
                "{}-{}.txt",
                request.correlation.run_id,
                if stream { "stream" } else { "chat" }
            ))
        });
        let result = match &transcript {
            Some(path) => run_command_with_transcript(
                cmd,
                Some(&stdin),
                self.timeout,
                self.output_limit_bytes,
                path,
            ),
            None => run_command_with_timeout(cmd, Some(&stdin), self.timeout, self.output_limit_bytes),
        };
        let output = result.map_err(|e| CollaboratorError::Transport(format!("{e:#}")))?;

        if output.timed_out {
            return Err(CollaboratorError::Timeout {
                secs: self.timeout.as_secs(),
            });
        }
        if !output.status.success() {
            let mut body = output.stderr_text();
            if body.trim().is_empty() {
                body = output.stdout_text();
            }
            return Err(CollaboratorError::Status {
                code: output.exit_code().unwrap_or(-1),
                body: body.trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl ChatClient for ProcessChatClient {
    #[instrument(skip_all, fields(role = %request.agent_role, run_id = %request.correlation.run_id))]
    fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, CollaboratorError> {
        let output = self.spawn(request, false)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let response = parse_chat_reply(&stdout)?;
        info!(
            bytes = response.content.len(),
            tokens = response.usage.map(|u| u.total()),
            "collaborator replied"
        );
        Ok(response)
    }

    #[instrument(skip_all, fields(role = %request.agent_role, run_id = %request.correlation.run_id))]
    fn stream(&self, request: &ChatRequest) -> Result<ChunkStream, CollaboratorError> {
        let output = self.spawn(request, true)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let chunks = parse_sse(&stdout);
        debug!(chunks = chunks.len(), "parsed event stream");
        Ok(Box::new(chunks.into_iter()))
    }
}

/// Decode a non-streaming reply. Non-JSON output is taken as the content.
pub fn parse_chat_reply(stdout: &str) -> Result<ChatResponse, CollaboratorError> {
    let trimmed = stdout.trim();
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return Ok(ChatResponse {
            content: trimmed.to_string(),
            usage: None,
        });
    };

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let code = value
            .get("status")
            .and_then(Value::as_i64)
            .and_then(|c| i32::try_from(c).ok())
            .unwrap_or(500);
        let body = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(CollaboratorError::Status { code, body });
    }

    let content = match value.get("content") {
        Some(Value::String(text)) => text.clone(),
        // Message with content blocks: concatenate the text blocks.
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .concat(),
        _ => trimmed.to_string(),
    };
    let usage = value
        .get("usage")
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());
    Ok(ChatResponse { content, usage })
}

/// Decode server-sent event lines into chunks.
///
/// Text arrives in `content_block_delta` events carrying a `text_delta`;
/// `message_stop` or a literal `[DONE]` ends the stream. Other events are
/// ignored; an `error` event becomes an error item.
pub fn parse_sse(text: &str) -> Vec<Result<StreamChunk, CollaboratorError>> {
    let mut chunks = Vec::new();
    for line in text.lines() {
        let Some(data) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            chunks.push(Ok(StreamChunk::End));
            break;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            warn!(line = data, "ignoring undecodable stream event");
            continue;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => {
                let delta = event.get("delta");
                if delta.and_then(|d| d.get("type")).and_then(Value::as_str) == Some("text_delta")
                    && let Some(piece) = delta.and_then(|d| d.get("text")).and_then(Value::as_str)
                {
                    chunks.push(Ok(StreamChunk::Text(piece.to_string())));
                }
            }
            Some("message_stop") => {
                chunks.push(Ok(StreamChunk::End));
                break;
            }
            Some("error") => {
                let message = event
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream error")
                    .to_string();
                chunks.push(Err(CollaboratorError::Transport(message)));
                break;
            }
            _ => {}
        }
    }
    chunks
}
