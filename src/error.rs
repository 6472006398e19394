use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
	#[error("tmux session not found: {0}")]
	SessionNotFound(String),

	#[error("tmux session already exists: {0}")]
	SessionExists(String),

	#[error("{program} failed: {message}")]
	CommandFailed { program: String, message: String },

	#[error("{program} timed out after {}ms", .after.as_millis())]
	Timeout { program: String, after: Duration },

	#[error("failed to spawn worker {slug}: {message}")]
	SpawnFailure { slug: String, message: String },

	#[error("merge conflict in {}", .files.join(", "))]
	MergeConflict { files: Vec<String> },

	#[error("worker session {0} is no longer running")]
	WorkerDead(String),

	#[error("failed to persist state: {0}")]
	Persistence(String),

	#[error("work group not found: {0}")]
	GroupNotFound(String),

	#[error("worker not found: {0}")]
	WorkerNotFound(String),

	#[error("{0}")]
	InvalidState(String),

	#[error("repository error: {0}")]
	Repository(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl ControlError {
	pub fn command(program: impl Into<String>, message: impl Into<String>) -> Self {
		ControlError::CommandFailed {
			program: program.into(),
			message: message.into(),
		}
	}

	/// Short machine-readable code sent to clients alongside the message.
	pub fn code(&self) -> &'static str {
		match self {
			ControlError::SessionNotFound(_) => "process_not_found",
			ControlError::SessionExists(_) => "session_exists",
			ControlError::CommandFailed { .. } => "command_failed",
			ControlError::Timeout { .. } => "timeout",
			ControlError::SpawnFailure { .. } => "spawn_failure",
			ControlError::MergeConflict { .. } => "merge_conflict",
			ControlError::WorkerDead(_) => "liveness_failure",
			ControlError::Persistence(_) => "persistence_failure",
			ControlError::GroupNotFound(_) => "group_not_found",
			ControlError::WorkerNotFound(_) => "worker_not_found",
			ControlError::InvalidState(_) => "invalid_state",
			ControlError::Repository(_) => "repository",
			ControlError::Io(_) => "io",
		}
	}
}

pub type ControlResult<T> = Result<T, ControlError>;
