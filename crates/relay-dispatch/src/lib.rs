//! Launches provider CLIs as subprocesses.
//!
//! stdout is captured to the contract output file and stderr to the debug
//! file; the prompt goes to stdin, which is then closed. No shell is used
//! on POSIX; Windows goes through `cmd /C` to resolve `.cmd` shims. The
//! executor enforces no timeout of its own — callers own cancellation.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use relay_types::{AgentRole, CommandTemplate};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("failed to spawn \"{command}\": {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct DispatchInput {
    pub run_id: String,
    pub role: AgentRole,
    pub task_id: String,
    pub project_path: PathBuf,
    pub prompt: String,
    pub command: CommandTemplate,
    pub contract_output_path: PathBuf,
    pub debug_output_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration_ms: u64,
    pub contract_output_path: PathBuf,
    pub debug_output_path: PathBuf,
}

impl DispatchResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run the provider CLI to completion and report its outcome. Spawn
/// failures surface as errors; non-zero exits are a normal result.
pub async fn execute(input: DispatchInput) -> Result<DispatchResult, DispatchError> {
    for path in [&input.contract_output_path, &input.debug_output_path] {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let contract_file = std::fs::File::create(&input.contract_output_path)?;
    let debug_file = std::fs::File::create(&input.debug_output_path)?;

    let mut command = build_command(&input.command);
    command
        .current_dir(&input.project_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(contract_file))
        .stderr(Stdio::from(debug_file));

    tracing::debug!(
        run_id = %input.run_id,
        role = %input.role,
        task_id = %input.task_id,
        command = %input.command.display,
        "spawning dispatch subprocess"
    );

    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| DispatchError::Spawn {
        command: input.command.display.clone(),
        source,
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.prompt.as_bytes()).await?;
        stdin.shutdown().await?;
        drop(stdin);
    }

    // Output streams are the files themselves, so waiting on the child is
    // also waiting for the streams to drain.
    let status = child.wait().await?;
    let duration_ms = start.elapsed().as_millis() as u64;

    let result = DispatchResult {
        exit_code: status.code(),
        signal: exit_signal(&status),
        duration_ms,
        contract_output_path: input.contract_output_path,
        debug_output_path: input.debug_output_path,
    };

    tracing::debug!(
        run_id = %input.run_id,
        task_id = %input.task_id,
        exit_code = result.exit_code.unwrap_or(-1),
        duration_ms,
        "dispatch subprocess finished"
    );

    Ok(result)
}

#[cfg(unix)]
fn build_command(template: &CommandTemplate) -> Command {
    let mut command = Command::new(&template.command);
    command.args(&template.args);
    command
}

#[cfg(windows)]
fn build_command(template: &CommandTemplate) -> Command {
    // cmd is needed to resolve .cmd shims for npm-installed CLIs.
    let mut command = Command::new("cmd");
    command.arg("/C").arg(&template.command);
    command.args(&template.args);
    command
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
