//! Task module - the turn loop, its documents, done sequences and
//! sub-task delegation.
//!
//! A [`Task`] wraps one [`ChatAgent`](crate::agents::ChatAgent) and decides
//! who speaks next. Every turn is a [`ChatDocument`] registered in the
//! shared [`DocumentStore`], so results can be traced back through parent
//! links even across task boundaries.

pub mod delegation;
pub mod document;
pub mod done;
pub mod task;

pub use delegation::TaskToolArgs;
pub use document::{ChatDocument, DocumentId, DocumentStore, Origin, ToolResult};
pub use done::{DoneSequence, EventKind};
pub use task::{CompletionReason, Task, TaskConfig, TaskError, TaskId, TaskOutcome, TaskStatus};
