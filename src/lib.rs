//! # tasklink
//!
//! Task orchestration for tool-calling LLM agents.
//!
//! This library provides:
//! - A provider-neutral LLM invocation layer with retries, streaming and
//!   usage accounting
//! - Chat agents that execute tools within a per-agent scope
//! - A task engine that drives turns until a done tool, a done sequence
//!   or a turn ceiling ends the run
//! - Sub-task delegation through the `task_tool` call, with provenance
//!   back to the delegating turn
//!
//! ## Task Flow
//!
//! ```text
//!   prompt ──► LLM ──► Agent (tools) ──► LLM ──► ... ──► done
//!                         │
//!                         └── task_tool ──► child Task ──► result
//! ```
//!
//! ## Modules
//! - `llm`: clients, messages, retries and the usage ledger
//! - `agents`: `ChatAgent` and the shared `TaskContext`
//! - `task`: the run loop, documents and delegation
//! - `tools`: tool trait, registry and scopes

pub mod agents;
pub mod config;
pub mod cost;
pub mod llm;
pub mod task;
pub mod tools;

pub use agents::{AgentConfig, ChatAgent, TaskContext};
pub use config::Config;
pub use task::{Task, TaskConfig, TaskOutcome, TaskStatus};
