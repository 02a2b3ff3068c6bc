//! Agent Gateway: role prompt, collaborator call, reply classification.
//!
//! Every call (including cache hits and failures) is appended to the
//! interaction log through the [`Store`].

pub mod cache;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::plan::{CodeBlock, FileChange};
use crate::core::plan_parser::{
    ActionPlan, extract_code_blocks, extract_file_changes, extract_keyed_json, parse_actions,
};
use crate::core::role::AgentRole;
use crate::core::types::{InteractionRecord, InteractionStatus};
use crate::error::{CollaboratorError, EngineError};
use crate::io::config::LlmConfig;
use crate::io::llm::{ChatClient, ChatMessage, ChatRequest, CorrelationIds, collect_stream};
use crate::io::prompt::{PromptEngine, PromptSection};
use crate::io::store::Store;

use cache::{ResponseCache, cache_key};

/// Inputs for one gateway call.
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub run_id: String,
    pub task_id: Option<u64>,
    pub milestone_id: Option<u64>,
    pub sections: Vec<PromptSection>,
}

/// Normalized shape of a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentPayload {
    /// A JSON object recovered from the reply.
    Structured(Value),
    /// Files named in the reply (`File: path` blocks).
    FileChanges(Vec<FileChange>),
    /// Fenced code without usable file names.
    CodeBlocks(Vec<CodeBlock>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    /// False when a file-producing role replied without anything usable.
    pub success: bool,
    pub data: AgentPayload,
    pub raw_text: String,
    pub cached: bool,
}

impl AgentResult {
    /// JSON rendering of the payload for milestone output.
    pub fn data_json(&self) -> Value {
        match &self.data {
            AgentPayload::Structured(value) => value.clone(),
            AgentPayload::FileChanges(changes) => {
                serde_json::json!({ "file_changes": changes })
            }
            AgentPayload::CodeBlocks(blocks) => serde_json::json!({ "code_blocks": blocks }),
            AgentPayload::Text(text) => serde_json::json!({ "text": text }),
        }
    }
}

/// Request parameters taken from `[llm]`.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewaySettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub prompt_budget_bytes: usize,
}

impl GatewaySettings {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self {
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            prompt_budget_bytes: cfg.prompt_budget_bytes,
        }
    }
}

pub struct Gateway {
    client: Arc<dyn ChatClient>,
    store: Arc<dyn Store>,
    prompts: PromptEngine,
    cache: ResponseCache,
    settings: GatewaySettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Chat,
    Stream,
}

struct Reply {
    text: String,
    cached: bool,
}

impl Gateway {
    pub fn new(
        client: Arc<dyn ChatClient>,
        store: Arc<dyn Store>,
        prompts: PromptEngine,
        cfg: &LlmConfig,
    ) -> Self {
        Self {
            client,
            store,
            prompts,
            cache: ResponseCache::new(cfg.cache_ttl()),
            settings: GatewaySettings::from_config(cfg),
        }
    }

    /// Ask `role` about `ctx` and classify the reply.
    #[instrument(skip_all, fields(role = %role, task_id = ?ctx.task_id, milestone_id = ?ctx.milestone_id))]
    pub fn execute(&self, role: AgentRole, ctx: &AgentContext) -> Result<AgentResult, EngineError> {
        let system = self.prompts.system_prompt(role)?;
        let reply = self.call(role, system, ctx, Mode::Chat)?;
        let result = classify(role, reply.text, reply.cached);
        debug!(success = result.success, cached = result.cached, "reply classified");
        Ok(result)
    }

    /// Request an execution plan over the streaming channel.
    #[instrument(skip_all, fields(task_id = ?ctx.task_id, milestone_id = ?ctx.milestone_id))]
    pub fn request_actions(&self, ctx: &AgentContext) -> Result<ActionPlan, EngineError> {
        let system = self.prompts.actions_prompt()?;
        let reply = self.call(AgentRole::Dev, system, ctx, Mode::Stream)?;
        let plan = parse_actions(&reply.text)?;
        for rejected in &plan.rejected {
            warn!(rejected = %rejected, "dropping malformed action");
        }
        info!(actions = plan.actions.len(), "execution plan received");
        Ok(plan)
    }

    fn call(
        &self,
        role: AgentRole,
        system: String,
        ctx: &AgentContext,
        mode: Mode,
    ) -> Result<Reply, EngineError> {
        let user = self
            .prompts
            .user_prompt(&ctx.sections, self.settings.prompt_budget_bytes)?;
        let request = ChatRequest {
            model: self.settings.model.clone(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            agent_role: role,
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            correlation: CorrelationIds {
                run_id: ctx.run_id.clone(),
                task_id: ctx.task_id,
                milestone_id: ctx.milestone_id,
            },
        };
        let mut key = cache_key(
            role,
            &request.messages,
            &request.model,
            request.temperature,
        );
        if mode == Mode::Stream {
            key.push_str(":stream");
        }

        if let Some(hit) = self.cache.get(&key) {
            info!("serving cached reply");
            self.record(&request, ctx, Some(&hit.content), None, 0, InteractionStatus::CacheHit, None)?;
            return Ok(Reply {
                text: hit.content,
                cached: true,
            });
        }

        let started = Instant::now();
        let outcome = match mode {
            Mode::Chat => self.client.chat(&request),
            Mode::Stream => self
                .client
                .stream(&request)
                .and_then(collect_stream)
                .map(|content| crate::io::llm::ChatResponse {
                    content,
                    usage: None,
                }),
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let response = match outcome {
            Ok(response) if response.content.trim().is_empty() => {
                let err = CollaboratorError::EmptyResponse;
                self.record_failure(&request, ctx, elapsed_ms, &err);
                return Err(err.into());
            }
            Ok(response) => response,
            Err(err) => {
                self.record_failure(&request, ctx, elapsed_ms, &err);
                return Err(err.into());
            }
        };

        self.record(
            &request,
            ctx,
            Some(&response.content),
            response.usage.map(|u| u.total()),
            elapsed_ms,
            InteractionStatus::Success,
            None,
        )?;
        self.cache.put(key, &response);
        Ok(Reply {
            text: response.content,
            cached: false,
        })
    }

    fn record_failure(
        &self,
        request: &ChatRequest,
        ctx: &AgentContext,
        elapsed_ms: u64,
        err: &CollaboratorError,
    ) {
        let status = match err {
            CollaboratorError::Timeout { .. } => InteractionStatus::Timeout,
            _ => InteractionStatus::Error,
        };
        warn!(err = %err, status = status.as_str(), "collaborator call failed");
        let message = err.to_string();
        if let Err(log_err) =
            self.record(request, ctx, None, None, elapsed_ms, status, Some(&message))
        {
            warn!(err = %format!("{log_err:#}"), "failed to record interaction");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        request: &ChatRequest,
        ctx: &AgentContext,
        response: Option<&str>,
        tokens_used: Option<u64>,
        execution_time_ms: u64,
        status: InteractionStatus,
        error: Option<&str>,
    ) -> Result<u64> {
        let prompt_of = |index: usize| {
            request
                .messages
                .get(index)
                .map(|m| m.content.clone())
                .unwrap_or_default()
        };
        self.store.append_interaction(InteractionRecord {
            id: 0,
            run_id: ctx.run_id.clone(),
            task_id: ctx.task_id,
            milestone_id: ctx.milestone_id,
            role: request.agent_role,
            system_prompt: prompt_of(0),
            user_prompt: prompt_of(1),
            response: response.map(str::to_string),
            model: request.model.clone(),
            tokens_used,
            execution_time_ms,
            status,
            error: error.map(str::to_string),
            created_at: Utc::now(),
        })
    }
}

/// JSON keys that mark a structured reply for each role.
fn role_keys(role: AgentRole) -> &'static [&'static str] {
    match role {
        AgentRole::Pm => &["milestones"],
        AgentRole::Ba => &["requirements", "acceptance_criteria"],
        AgentRole::Ux => &["screens", "flows"],
        AgentRole::Arch => &["architecture", "file_changes"],
        AgentRole::Dev => &["file_changes", "actions"],
        AgentRole::Qa => &["assessment", "issues", "test_plan"],
        AgentRole::Doc => &["documentation", "file_changes"],
    }
}

/// Structured JSON first, then named files and code blocks for roles that
/// produce files, then plain text.
pub fn classify(role: AgentRole, raw_text: String, cached: bool) -> AgentResult {
    if let Some(value) = extract_keyed_json(&raw_text, role_keys(role)) {
        return AgentResult {
            success: true,
            data: AgentPayload::Structured(value),
            raw_text,
            cached,
        };
    }

    if role.produces_files() {
        let changes = extract_file_changes(&raw_text);
        if !changes.is_empty() {
            return AgentResult {
                success: true,
                data: AgentPayload::FileChanges(changes),
                raw_text,
                cached,
            };
        }
        let blocks = extract_code_blocks(&raw_text);
        if !blocks.is_empty() {
            return AgentResult {
                success: true,
                data: AgentPayload::CodeBlocks(blocks),
                raw_text,
                cached,
            };
        }
    }

    AgentResult {
        success: !role.produces_files(),
        data: AgentPayload::Text(raw_text.clone()),
        raw_text,
        cached,
    }
}
