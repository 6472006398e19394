use crate::config::Timing;
use crate::error::{ControlError, ControlResult};
use crate::process::{self, CommandOutput};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Environment variable set on every session the daemon creates.
pub const TAG_ENV: &str = "COMPANION_MANAGED";

/// Common tmux installation paths
const TMUX_PATHS: &[&str] = &[
	"/opt/homebrew/bin/tmux", // Apple Silicon Homebrew
	"/usr/local/bin/tmux",    // Intel Homebrew
	"/usr/bin/tmux",          // System
	"/bin/tmux",              // Fallback
];

/// Cached tmux path - found once at startup
static TMUX_PATH: OnceLock<String> = OnceLock::new();

/// Find tmux binary, checking common locations if not in PATH
pub fn find_tmux() -> &'static str {
	TMUX_PATH.get_or_init(|| {
		if let Ok(output) = Command::new("which").arg("tmux").output() {
			if output.status.success() {
				let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
				if !path.is_empty() && Path::new(&path).exists() {
					return path;
				}
			}
		}

		for path in TMUX_PATHS {
			if Path::new(path).exists() {
				return path.to_string();
			}
		}

		"tmux".to_string()
	})
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TmuxSession {
	pub name: String,
	pub created_at: Option<DateTime<Utc>>,
	pub attached: bool,
	pub window_count: u32,
	pub working_dir: Option<String>,
	pub tagged: bool,
}

/// Keys the daemon injects besides literal text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
	Enter,
	Down,
	Space,
	Interrupt,
	Eof,
}

impl Key {
	pub fn tmux_name(self) -> &'static str {
		match self {
			Key::Enter => "Enter",
			Key::Down => "Down",
			Key::Space => "Space",
			Key::Interrupt => "C-c",
			Key::Eof => "C-d",
		}
	}
}

/// Raw terminal-multiplexer control. No policy lives here: callers that type into
/// a pane must go through `InputInjector` so keystrokes never interleave.
#[async_trait]
pub trait Multiplexer: Send + Sync {
	async fn list_sessions(&self) -> ControlResult<Vec<TmuxSession>>;

	async fn has_session(&self, name: &str) -> bool;

	/// Creates a detached, tagged session and returns its sanitized name.
	async fn create_session(
		&self,
		name: &str,
		working_dir: &Path,
		start_agent: bool,
	) -> ControlResult<String>;

	async fn kill_session(&self, name: &str) -> ControlResult<()>;

	async fn send_literal(&self, target: &str, text: &str) -> ControlResult<()>;

	async fn send_key(&self, target: &str, key: Key) -> ControlResult<()>;

	/// Pane text for status inference. `offset` lines are skipped from the bottom.
	async fn capture_pane(&self, target: &str, lines: usize, offset: usize) -> ControlResult<String>;
}

pub struct Tmux {
	timing: Timing,
	agent_command: String,
}

impl Tmux {
	pub fn new(timing: Timing, agent_command: impl Into<String>) -> Self {
		Self {
			timing,
			agent_command: agent_command.into(),
		}
	}

	async fn tmux<I, S>(&self, args: I) -> ControlResult<CommandOutput>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<std::ffi::OsStr>,
	{
		process::run(find_tmux(), args, None, self.timing.command_timeout()).await
	}

	async fn is_tagged(&self, name: &str) -> bool {
		match self.tmux(["show-environment", "-t", name, TAG_ENV]).await {
			Ok(out) => out.success && out.stdout.trim() == format!("{TAG_ENV}=1"),
			Err(_) => false,
		}
	}

	async fn require_session(&self, name: &str) -> ControlResult<()> {
		if self.has_session(name).await {
			Ok(())
		} else {
			Err(ControlError::SessionNotFound(name.to_string()))
		}
	}
}

#[async_trait]
impl Multiplexer for Tmux {
	async fn list_sessions(&self) -> ControlResult<Vec<TmuxSession>> {
		let out = self
			.tmux([
				"list-sessions",
				"-F",
				"#{session_name}\t#{session_created}\t#{session_attached}\t#{session_windows}\t#{pane_current_path}",
			])
			.await?;

		// No server running means no sessions, not an error.
		if !out.success {
			return Ok(vec![]);
		}

		let mut sessions: Vec<TmuxSession> =
			out.stdout.lines().filter_map(parse_session_line).collect();
		for session in &mut sessions {
			session.tagged = self.is_tagged(&session.name).await;
		}
		Ok(sessions)
	}

	async fn has_session(&self, name: &str) -> bool {
		// `=` forces an exact match instead of tmux's prefix matching.
		match self.tmux(["has-session", "-t", format!("={name}").as_str()]).await {
			Ok(out) => out.success,
			Err(_) => false,
		}
	}

	async fn create_session(
		&self,
		name: &str,
		working_dir: &Path,
		start_agent: bool,
	) -> ControlResult<String> {
		let session = sanitize_session_name(name);
		if session.is_empty() {
			return Err(ControlError::InvalidState(format!(
				"invalid session name: {name:?}"
			)));
		}
		if !working_dir.is_dir() {
			return Err(ControlError::InvalidState(format!(
				"working directory does not exist: {}",
				working_dir.display()
			)));
		}
		if self.has_session(&session).await {
			return Err(ControlError::SessionExists(session));
		}

		let dir = working_dir.to_string_lossy();
		self.tmux(["new-session", "-d", "-s", session.as_str(), "-c", &*dir])
			.await?
			.check("tmux new-session")?;

		if let Err(e) = self
			.tmux(["set-environment", "-t", session.as_str(), TAG_ENV, "1"])
			.await
			.and_then(|out| out.check("tmux set-environment"))
		{
			warn!(session = %session, error = %e, "failed to tag session");
		}

		info!(session = %session, dir = %working_dir.display(), start_agent, "created tmux session");

		if start_agent {
			// Give the shell time to print its prompt before typing into it.
			sleep(self.timing.session_settle()).await;
			self.send_literal(&session, &self.agent_command).await?;
			self.send_key(&session, Key::Enter).await?;
		}
		Ok(session)
	}

	async fn kill_session(&self, name: &str) -> ControlResult<()> {
		self.require_session(name).await?;

		// Interrupt first, then EOF: a program mid-operation may swallow a bare
		// `exit`, while EOF is honoured in any input mode.
		let step = self.timing.kill_step();
		let _ = self.send_key(name, Key::Interrupt).await;
		sleep(step).await;
		let _ = self.send_key(name, Key::Eof).await;
		sleep(step).await;
		if self.has_session(name).await {
			let _ = self.send_literal(name, "exit").await;
			let _ = self.send_key(name, Key::Enter).await;
			sleep(step).await;
		}

		if self.has_session(name).await {
			debug!(session = %name, "graceful shutdown failed, forcing kill");
			self.tmux(["kill-session", "-t", format!("={name}").as_str()])
				.await?
				.check("tmux kill-session")?;
		}
		info!(session = %name, "killed tmux session");
		Ok(())
	}

	async fn send_literal(&self, target: &str, text: &str) -> ControlResult<()> {
		self.tmux(literal_args(target, text))
			.await?
			.check("tmux send-keys")?;
		Ok(())
	}

	async fn send_key(&self, target: &str, key: Key) -> ControlResult<()> {
		self.tmux(["send-keys", "-t", target, key.tmux_name()])
			.await?
			.check("tmux send-keys")?;
		Ok(())
	}

	async fn capture_pane(&self, target: &str, lines: usize, offset: usize) -> ControlResult<String> {
		self.require_session(target).await?;
		let pane = format!("{target}:0.0");
		let start = format!("-{}", lines + offset);
		let end = format!("-{offset}");
		let mut args = vec!["capture-pane", "-p", "-J", "-t", pane.as_str(), "-S", start.as_str()];
		if offset > 0 {
			args.push("-E");
			args.push(end.as_str());
		}
		let out = self.tmux(args).await?.check("tmux capture-pane")?;
		Ok(out.stdout)
	}
}

/// `send-keys` in literal mode. The `--` keeps text that starts with a dash
/// from being parsed as flags.
fn literal_args<'a>(target: &'a str, text: &'a str) -> [&'a str; 6] {
	["send-keys", "-l", "-t", target, "--", text]
}

/// Replaces characters tmux rejects in session names (`.` and `:`) and anything
/// else outside a conservative set.
pub fn sanitize_session_name(name: &str) -> String {
	let cleaned: String = name
		.trim()
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
				c
			} else {
				'-'
			}
		})
		.collect();
	cleaned.trim_matches('-').to_string()
}

/// Parses one `list-sessions` line in the tab-separated format used above.
pub fn parse_session_line(line: &str) -> Option<TmuxSession> {
	let mut parts = line.split('\t');
	let name = parts.next()?.trim();
	if name.is_empty() {
		return None;
	}
	let created_at = parts
		.next()
		.and_then(|s| s.trim().parse::<i64>().ok())
		.and_then(|secs| DateTime::from_timestamp(secs, 0));
	let attached = parts
		.next()
		.and_then(|s| s.trim().parse::<u32>().ok())
		.map(|n| n > 0)
		.unwrap_or(false);
	let window_count = parts
		.next()
		.and_then(|s| s.trim().parse::<u32>().ok())
		.unwrap_or(0);
	let working_dir = parts
		.next()
		.map(|s| s.trim().to_string())
		.filter(|s| !s.is_empty());
	Some(TmuxSession {
		name: name.to_string(),
		created_at,
		attached,
		window_count,
		working_dir,
		tagged: false,
	})
}
