//! Agents module - LLM-backed agents and the context they run in.
//!
//! # Agent Types
//! - **ChatAgent**: owns a conversation history, asks one LLM for replies
//!   and executes the tools its [`ToolScope`](crate::tools::ToolScope) allows
//!
//! A [`TaskContext`] carries what a whole tree of tasks shares: config,
//! usage ledger, document store, client factory and cancellation.

mod chat;
mod context;
mod types;

pub use chat::ChatAgent;
pub use context::{RunMode, StdinInput, TaskContext, UserInput};
pub use types::{AgentConfig, AgentError, AgentId};
