//! LLM-driven task orchestrator.
//!
//! A task is decomposed by a planner into ordered, role-scoped milestones;
//! each milestone is driven through the model and its output applied to a
//! workspace through a sandbox. The crate keeps a strict split:
//!
//! - **[`core`]**: pure, deterministic logic (state machines, roles, plan
//!   types, plan parsing). No I/O.
//! - **[`io`]**: side-effecting adapters (sandboxed files and commands,
//!   storage, locks, the model collaborator, prompts, version control).
//!
//! Orchestration modules ([`gateway`], [`engine`], [`dispatcher`],
//! [`retention`], [`status`]) combine the two to implement CLI commands.

pub mod core;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod gateway;
pub mod io;
pub mod logging;
pub mod retention;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
