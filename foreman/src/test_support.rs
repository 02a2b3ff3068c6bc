//! Test-only helpers: a scripted collaborator and a temporary workspace.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use crate::core::types::{NewTask, Task, TaskType};
use crate::engine::Engine;
use crate::error::CollaboratorError;
use crate::io::config::ForemanConfig;
use crate::io::llm::{ChatClient, ChatRequest, ChatResponse, ChunkStream, StreamChunk, Usage};
use crate::io::locks::MemoryLocks;
use crate::io::store::{MemoryStore, Store};

/// One queued collaborator reply.
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(String),
    /// Chunks delivered in order, followed by the end marker.
    Stream(Vec<String>),
    /// Chunks with no end marker.
    Truncated(Vec<String>),
    Fail(CollaboratorError),
    /// A reply delivered after the given delay.
    Slow(Duration, String),
}

/// Replays queued replies in order and records every request.
#[derive(Debug, Default)]
pub struct ScriptedChatClient {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChatClient {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, item: Scripted) {
        self.script.lock().expect("script lock").push_back(item);
    }

    pub fn reply(&self, text: &str) {
        self.push(Scripted::Reply(text.to_string()));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().expect("script lock").len()
    }

    fn next(&self, request: &ChatRequest) -> Option<Scripted> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        self.script.lock().expect("script lock").pop_front()
    }
}

fn exhausted() -> CollaboratorError {
    CollaboratorError::Transport("script exhausted".to_string())
}

fn reply(content: String) -> ChatResponse {
    ChatResponse {
        content,
        usage: Some(Usage {
            input_tokens: 10,
            output_tokens: 20,
        }),
    }
}

impl ChatClient for ScriptedChatClient {
    fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, CollaboratorError> {
        match self.next(request).ok_or_else(exhausted)? {
            Scripted::Reply(content) => Ok(reply(content)),
            Scripted::Slow(delay, content) => {
                thread::sleep(delay);
                Ok(reply(content))
            }
            Scripted::Stream(chunks) | Scripted::Truncated(chunks) => Ok(ChatResponse {
                content: chunks.concat(),
                usage: None,
            }),
            Scripted::Fail(err) => Err(err),
        }
    }

    fn stream(&self, request: &ChatRequest) -> Result<ChunkStream, CollaboratorError> {
        let chunks: Vec<Result<StreamChunk, CollaboratorError>> =
            match self.next(request).ok_or_else(exhausted)? {
                Scripted::Reply(text) => vec![Ok(StreamChunk::Text(text)), Ok(StreamChunk::End)],
                Scripted::Slow(delay, text) => {
                    thread::sleep(delay);
                    vec![Ok(StreamChunk::Text(text)), Ok(StreamChunk::End)]
                }
                Scripted::Stream(chunks) => chunks
                    .into_iter()
                    .map(|c| Ok(StreamChunk::Text(c)))
                    .chain(std::iter::once(Ok(StreamChunk::End)))
                    .collect(),
                Scripted::Truncated(chunks) => {
                    chunks.into_iter().map(|c| Ok(StreamChunk::Text(c))).collect()
                }
                Scripted::Fail(err) => return Err(err),
            };
        Ok(Box::new(chunks.into_iter()))
    }
}

/// A temporary workspace with in-memory state and a scripted collaborator.
pub struct TestHarness {
    _dir: TempDir,
    workspace: PathBuf,
    pub config: ForemanConfig,
    pub store: Arc<MemoryStore>,
    pub locks: Arc<MemoryLocks>,
    pub client: Arc<ScriptedChatClient>,
}

impl TestHarness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let workspace = dir.path().join("workspace");
        fs::create_dir_all(&workspace).expect("create workspace");
        let mut config = ForemanConfig::default();
        config.state_dir = dir.path().join(".foreman");
        config.workspace.root = workspace.clone();
        Self {
            _dir: dir,
            workspace,
            config,
            store: Arc::new(MemoryStore::new()),
            locks: Arc::new(MemoryLocks::new()),
            client: Arc::new(ScriptedChatClient::default()),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn engine(&self) -> Engine {
        Engine::from_config(
            &self.config,
            self.store.clone(),
            self.client.clone(),
            self.locks.clone(),
        )
        .expect("build engine")
    }

    pub fn seed(&self, title: &str, task_type: TaskType) -> Task {
        self.store
            .create_task(new_task(title, task_type))
            .expect("seed task")
    }

    pub fn write_file(&self, relative: &str, content: &str) {
        let path = self.workspace.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write workspace file");
    }

    pub fn read_file(&self, relative: &str) -> String {
        fs::read_to_string(self.workspace.join(relative)).expect("read workspace file")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// A pending task with deterministic defaults.
pub fn new_task(title: &str, task_type: TaskType) -> NewTask {
    NewTask {
        task_type,
        title: title.to_string(),
        description: format!("{title} description"),
        content: json!({ "source": "test" }),
        priority: 0,
    }
}
