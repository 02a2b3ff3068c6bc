//! Agent Gateway behavior: interaction logging, caching and error mapping.

use std::sync::Arc;

use foreman::core::role::AgentRole;
use foreman::core::types::InteractionStatus;
use foreman::error::{CollaboratorError, EngineError};
use foreman::gateway::{AgentContext, AgentPayload, Gateway};
use foreman::io::config::LlmConfig;
use foreman::io::prompt::{PromptEngine, PromptSection};
use foreman::io::store::{MemoryStore, Store};
use foreman::test_support::{Scripted, ScriptedChatClient};

fn gateway(cfg: &LlmConfig) -> (Gateway, Arc<ScriptedChatClient>, Arc<MemoryStore>) {
    let client = Arc::new(ScriptedChatClient::default());
    let store = Arc::new(MemoryStore::new());
    let prompts = PromptEngine::new("/srv/app", &["cargo".to_string()]).expect("prompts");
    let gateway = Gateway::new(client.clone(), store.clone(), prompts, cfg);
    (gateway, client, store)
}

fn context() -> AgentContext {
    AgentContext {
        run_id: "run-1".to_string(),
        task_id: Some(7),
        milestone_id: Some(3),
        sections: vec![PromptSection::required("task", "{\"title\": \"Add search\"}")],
    }
}

#[test]
fn identical_requests_are_served_from_cache_and_logged_as_hits() {
    let (gateway, client, store) = gateway(&LlmConfig::default());
    client.reply(r#"{"requirements": ["fast search"]}"#);

    let first = gateway.execute(AgentRole::Ba, &context()).expect("first");
    let second = gateway.execute(AgentRole::Ba, &context()).expect("second");
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.data, second.data);
    assert_eq!(client.requests().len(), 1);

    let statuses: Vec<InteractionStatus> = store
        .interactions(Some(7))
        .expect("log")
        .iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(
        statuses,
        vec![InteractionStatus::Success, InteractionStatus::CacheHit]
    );
}

#[test]
fn different_roles_do_not_share_cache_entries() {
    let (gateway, client, _store) = gateway(&LlmConfig::default());
    client.reply("analysis");
    client.reply("design");
    gateway.execute(AgentRole::Ba, &context()).expect("ba");
    let ux = gateway.execute(AgentRole::Ux, &context()).expect("ux");
    assert!(!ux.cached);
    assert_eq!(ux.data, AgentPayload::Text("design".to_string()));
}

#[test]
fn disabled_cache_always_calls_the_collaborator() {
    let cfg = LlmConfig {
        cache_ttl_secs: 0,
        ..LlmConfig::default()
    };
    let (gateway, client, _store) = gateway(&cfg);
    client.reply("one");
    client.reply("two");
    gateway.execute(AgentRole::Qa, &context()).expect("first");
    let second = gateway.execute(AgentRole::Qa, &context()).expect("second");
    assert_eq!(second.raw_text, "two");
    assert_eq!(client.requests().len(), 2);
}

#[test]
fn failures_are_logged_with_their_kind() {
    let (gateway, client, store) = gateway(&LlmConfig::default());
    client.push(Scripted::Fail(CollaboratorError::Timeout { secs: 600 }));
    client.reply("   ");

    let err = gateway.execute(AgentRole::Dev, &context()).expect_err("timeout");
    assert!(matches!(
        err,
        EngineError::Collaborator(CollaboratorError::Timeout { secs: 600 })
    ));
    let err = gateway.execute(AgentRole::Dev, &context()).expect_err("empty");
    assert!(matches!(
        err,
        EngineError::Collaborator(CollaboratorError::EmptyResponse)
    ));

    let log = store.interactions(None).expect("log");
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].status, InteractionStatus::Timeout);
    assert_eq!(log[1].status, InteractionStatus::Error);
    assert!(log.iter().all(|r| r.response.is_none() && r.error.is_some()));
}

#[test]
fn requests_carry_role_prompt_and_correlation_ids() {
    let (gateway, client, store) = gateway(&LlmConfig::default());
    client.reply(r#"{"milestones": [{"title": "Implement search"}]}"#);
    gateway.execute(AgentRole::Pm, &context()).expect("pm");

    let request = &client.requests()[0];
    assert_eq!(request.agent_role, AgentRole::Pm);
    assert_eq!(request.correlation.task_id, Some(7));
    assert_eq!(request.messages.len(), 2);
    assert!(request.messages[1].content.contains("TASK:"));

    let record = &store.interactions(Some(7)).expect("log")[0];
    assert_eq!(record.run_id, "run-1");
    assert_eq!(record.milestone_id, Some(3));
    assert_eq!(record.tokens_used, Some(30));
    assert_eq!(record.system_prompt, request.messages[0].content);
}

#[test]
fn streamed_execution_plans_are_reassembled() {
    let (gateway, client, _store) = gateway(&LlmConfig::default());
    client.push(Scripted::Stream(vec![
        "```json\n{\"actions\": [{\"action\": \"run_npm\", ".to_string(),
        "\"command\": \"npm\", \"args\": [\"install\"]}, {\"action\": \"teleport\"}]}\n```"
            .to_string(),
    ]));
    let plan = gateway.request_actions(&context()).expect("plan");
    assert_eq!(plan.actions.len(), 1);
    assert_eq!(plan.actions[0].kind(), "run_command");
    assert_eq!(plan.rejected.len(), 1);
}
