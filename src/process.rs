use crate::error::{ControlError, ControlResult};
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandOutput {
	pub success: bool,
	pub code: Option<i32>,
	pub stdout: String,
	pub stderr: String,
}

impl CommandOutput {
	/// Converts a non-zero exit into `CommandFailed`, keeping stderr as the message.
	pub fn check(self, program: &str) -> ControlResult<CommandOutput> {
		if self.success {
			return Ok(self);
		}
		let message = if self.stderr.trim().is_empty() {
			format!("exit code {}", self.code.unwrap_or(-1))
		} else {
			self.stderr.trim().to_string()
		};
		Err(ControlError::command(program, message))
	}
}

/// Runs a program to completion with a hard timeout. The child is killed if the
/// timeout fires, so a wedged tmux or git never hangs the caller.
pub async fn run<I, S>(
	program: &str,
	args: I,
	cwd: Option<&Path>,
	limit: Duration,
) -> ControlResult<CommandOutput>
where
	I: IntoIterator<Item = S>,
	S: AsRef<OsStr>,
{
	let mut cmd = Command::new(program);
	cmd.args(args)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true);
	if let Some(dir) = cwd {
		cmd.current_dir(dir);
	}

	let output = match timeout(limit, cmd.output()).await {
		Ok(Ok(output)) => output,
		Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
			return Err(ControlError::command(program, "executable not found"));
		}
		Ok(Err(e)) => return Err(ControlError::command(program, e.to_string())),
		Err(_) => {
			return Err(ControlError::Timeout {
				program: program.to_string(),
				after: limit,
			});
		}
	};

	let result = CommandOutput {
		success: output.status.success(),
		code: output.status.code(),
		stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
		stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
	};
	if !result.success {
		debug!(program, code = ?result.code, stderr = %result.stderr.trim(), "command exited non-zero");
	}
	Ok(result)
}
