//! Task execution context - shared state across a tree of tasks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::llm::{ClientFactory, ProviderFactory, StreamSink, UsageLedger};
use crate::task::DocumentStore;

/// How the root task was started; children inherit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Driven from an existing async runtime
    Async,
    /// Driven through `Task::run_blocking`
    Blocking,
}

/// Source of user turns for interactive tasks.
#[async_trait]
pub trait UserInput: Send + Sync {
    /// Show `prompt` and return what the user typed.
    async fn read(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Reads user turns line by line from stdin.
pub struct StdinInput;

#[async_trait]
impl UserInput for StdinInput {
    async fn read(&self, prompt: &str) -> anyhow::Result<String> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(format!("{}\n> ", prompt).as_bytes()).await?;
        stdout.flush().await?;

        let mut line = String::new();
        let n = BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        if n == 0 {
            anyhow::bail!("stdin closed");
        }
        Ok(line.trim_end().to_string())
    }
}

/// Shared context passed to every task during execution.
///
/// # Thread Safety
/// Cloning is cheap: shared parts live behind `Arc`s. Concurrent sibling
/// tasks each get their own clone via [`child_context`](Self::child_context).
#[derive(Clone)]
pub struct TaskContext {
    /// Application configuration
    pub config: Config,

    /// Token and cost accounting, keyed by model
    pub ledger: Arc<UsageLedger>,

    /// Provenance index of every document produced
    pub documents: Arc<DocumentStore>,

    /// Builds clients for models named by delegation calls
    pub clients: Arc<dyn ClientFactory>,

    /// Cooperative cancellation for the whole tree.
    pub cancel_token: CancellationToken,

    pub user_input: Option<Arc<dyn UserInput>>,

    /// Receives streamed output when streaming is on
    pub sink: Option<Arc<dyn StreamSink>>,

    pub mode: RunMode,

    /// Delegation depth of the task using this context (root = 0)
    pub depth: usize,
}

impl TaskContext {
    /// Create a context whose delegated clients reuse the configured provider.
    pub fn new(config: Config, ledger: Arc<UsageLedger>) -> Self {
        let clients = Arc::new(ProviderFactory::new(config.llm_config(), Arc::clone(&ledger)));
        Self::with_clients(config, ledger, clients)
    }

    pub fn with_clients(
        config: Config,
        ledger: Arc<UsageLedger>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            config,
            ledger,
            documents: Arc::new(DocumentStore::new()),
            clients,
            cancel_token: CancellationToken::new(),
            user_input: None,
            sink: None,
            mode: RunMode::Async,
            depth: 0,
        }
    }

    pub fn with_user_input(mut self, input: Arc<dyn UserInput>) -> Self {
        self.user_input = Some(input);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn StreamSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Create a context for a delegated task, one level deeper.
    ///
    /// # Postcondition
    /// `child.depth == self.depth + 1`; cancelling `self` cancels the child.
    pub fn child_context(&self) -> Self {
        Self {
            cancel_token: self.cancel_token.child_token(),
            depth: self.depth + 1,
            ..self.clone()
        }
    }

    /// Check if further delegation is allowed.
    pub fn can_delegate(&self) -> bool {
        self.depth < self.config.max_depth
    }

    /// Check if cooperative cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Whether streamed output is allowed at all in this run.
    pub fn streaming_allowed(&self) -> bool {
        self.config.stream && !(self.mode == RunMode::Async && self.config.async_stream_quiet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_context_depth_and_cancel() {
        let ctx = TaskContext::new(Config::new("mock", "m"), Arc::new(UsageLedger::new()));
        let child = ctx.child_context();
        assert_eq!(child.depth, 1);
        assert!(Arc::ptr_eq(&ctx.documents, &child.documents));

        ctx.cancel_token.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_depth_cap() {
        let mut config = Config::new("mock", "m");
        config.max_depth = 1;
        let ctx = TaskContext::new(config, Arc::new(UsageLedger::new()));
        assert!(ctx.can_delegate());
        assert!(!ctx.child_context().can_delegate());
    }

    #[test]
    fn test_async_runs_stay_quiet() {
        let mut config = Config::new("mock", "m");
        config.stream = true;
        let ctx = TaskContext::new(config, Arc::new(UsageLedger::new()));
        assert!(!ctx.streaming_allowed());
        assert!(ctx.clone().with_mode(RunMode::Blocking).streaming_allowed());
    }
}
