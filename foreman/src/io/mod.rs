//! Side-effecting adapters: filesystem sandbox, processes, storage, locks and
//! the chat collaborator.

pub mod command_runner;
pub mod config;
pub mod file_patcher;
pub mod json_store;
pub mod llm;
pub mod locks;
pub mod process;
pub mod prompt;
pub mod snapshot;
pub mod store;
pub mod vcs;
