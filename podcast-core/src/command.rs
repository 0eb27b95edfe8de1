use std::io;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

/// Runs external programs. Tests substitute a scripted implementation.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        command.output().await
    }
}

/// Result of running a tool with a deadline.
#[derive(Debug)]
pub enum ToolOutcome {
    Completed(Output),
    NotFound,
    SpawnFailed(io::Error),
    TimedOut(Duration),
}

impl ToolOutcome {
    pub fn stderr_lossy(output: &Output) -> String {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    }
}

pub async fn run_with_timeout(
    executor: &dyn CommandExecutor,
    command: &mut Command,
    limit: Duration,
) -> ToolOutcome {
    command.kill_on_drop(true);
    match timeout(limit, executor.run(command)).await {
        Ok(Ok(output)) => ToolOutcome::Completed(output),
        Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => ToolOutcome::NotFound,
        Ok(Err(err)) => ToolOutcome::SpawnFailed(err),
        Err(_) => ToolOutcome::TimedOut(limit),
    }
}

/// Renders a command line for diagnostics.
pub fn describe(command: &Command) -> String {
    let std = command.as_std();
    let mut rendered = std.get_program().to_string_lossy().to_string();
    for arg in std.get_args() {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}
