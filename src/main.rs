//! tasklink - command-line entry point
//!
//! Runs one root task on a prompt and prints its result plus a usage summary.
//!
//! ```text
//! tasklink [--blocking] <prompt...>
//! ```

use std::io::Write;
use std::sync::Arc;

use tasklink::agents::{AgentConfig, ChatAgent, StdinInput, TaskContext};
use tasklink::config::Config;
use tasklink::llm::{StreamEvent, StreamSink, UsageLedger};
use tasklink::task::{ChatDocument, Origin, Task, TaskConfig, TaskOutcome, TaskStatus};
use tasklink::tools::{ToolRegistry, ToolScope, TASK_TOOL};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SYSTEM_MESSAGE: &str = "You are a helpful assistant. Break large problems into \
self-contained sub-problems and delegate them with `task_tool` when that helps. \
When you have the final answer, return it with `done_tool`.";

/// Writes streamed text straight to stdout.
struct StdoutSink;

impl StreamSink for StdoutSink {
    fn on_event(&self, event: &StreamEvent) -> anyhow::Result<()> {
        let mut out = std::io::stdout().lock();
        match event {
            StreamEvent::Text(text) => write!(out, "{}", text)?,
            StreamEvent::FunctionName(name) | StreamEvent::ToolName(name) => {
                write!(out, "\n[{}] ", name)?
            }
            StreamEvent::FunctionArgs(args) | StreamEvent::ToolArgs(args) => write!(out, "{}", args)?,
        }
        out.flush()?;
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasklink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let blocking = match args.iter().position(|a| a == "--blocking") {
        Some(i) => {
            args.remove(i);
            true
        }
        None => false,
    };
    let prompt = args.join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("usage: tasklink [--blocking] <prompt...>");
    }

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: provider={}, model={}",
        config.provider, config.default_model
    );

    let ledger = Arc::new(UsageLedger::new());
    let mut ctx = TaskContext::new(config.clone(), Arc::clone(&ledger)).with_sink(Arc::new(StdoutSink));
    if config.interactive {
        ctx = ctx.with_user_input(Arc::new(StdinInput));
    }

    let mut task = root_task(&config, &ctx)?;
    let outcome = if blocking {
        let prompt = ChatDocument::new(Origin::User, prompt).with_sender("User");
        task.run_blocking(Some(prompt), &ctx)
    } else {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let token = ctx.cancel_token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling");
                    token.cancel();
                }
            });
            task.run_prompt(prompt, &ctx).await
        })
    };

    report(&outcome, &ledger);
    match outcome.status {
        TaskStatus::Aborted { reason } => anyhow::bail!("task aborted: {}", reason),
        _ => Ok(()),
    }
}

fn root_task(config: &Config, ctx: &TaskContext) -> anyhow::Result<Task> {
    let llm = ctx.clients.client_for(&config.default_model)?;
    let mut scope = ToolScope::new(ToolRegistry::new());
    scope.enable(&[TASK_TOOL], true, true)?;

    let agent = ChatAgent::new(AgentConfig::new("Main", SYSTEM_MESSAGE), llm, scope);
    Ok(Task::new(
        agent,
        TaskConfig::new("Main")
            .interactive(config.interactive)
            .with_turns(config.max_turns),
    ))
}

fn report(outcome: &TaskOutcome, ledger: &UsageLedger) {
    info!(status = ?outcome.status, turns = outcome.turns, "Run finished");
    if outcome.status.is_completed() {
        println!("\n{}", outcome.content());
    }
    let summary = ledger.summary();
    if !summary.is_empty() {
        println!("\n{}", summary);
    }
}
