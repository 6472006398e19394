//! In-memory stand-ins for tmux and git used across unit tests.

use crate::error::{ControlError, ControlResult};
use crate::git::{worktree_path_for, MergeOutcome, Vcs, Worktree};
use crate::model::CommitSummary;
use crate::tmux::{sanitize_session_name, Key, Multiplexer, TmuxSession};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const BOOT_SCREEN: &str = "╭────╮\n│ >  │\n╰────╯\n  ? for shortcuts\n";

#[derive(Default)]
struct FakeSession {
	working_dir: String,
	pane: String,
	keys: Vec<String>,
}

/// Panes are plain strings: literal text is appended, Enter appends a newline.
#[derive(Default)]
pub struct FakeMux {
	sessions: Mutex<HashMap<String, FakeSession>>,
	fail_create: Mutex<bool>,
	boot: Mutex<Option<String>>,
}

impl FakeMux {
	pub fn new() -> Self {
		Self {
			boot: Mutex::new(Some(BOOT_SCREEN.to_string())),
			..Self::default()
		}
	}

	pub fn add_session(&self, name: &str, working_dir: &str) {
		self.sessions.lock().unwrap().insert(
			name.to_string(),
			FakeSession {
				working_dir: working_dir.to_string(),
				..FakeSession::default()
			},
		);
	}

	/// Simulates a session dying behind the daemon's back.
	pub fn remove_session(&self, name: &str) {
		self.sessions.lock().unwrap().remove(name);
	}

	pub fn pane(&self, name: &str) -> String {
		self.sessions
			.lock()
			.unwrap()
			.get(name)
			.map(|s| s.pane.clone())
			.unwrap_or_default()
	}

	pub fn set_pane(&self, name: &str, text: &str) {
		if let Some(s) = self.sessions.lock().unwrap().get_mut(name) {
			s.pane = text.to_string();
		}
	}

	pub fn keys(&self, name: &str) -> Vec<String> {
		self.sessions
			.lock()
			.unwrap()
			.get(name)
			.map(|s| s.keys.clone())
			.unwrap_or_default()
	}

	pub fn session_names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
		names.sort();
		names
	}

	pub fn fail_creates(&self, fail: bool) {
		*self.fail_create.lock().unwrap() = fail;
	}

	/// Agent never prints its ready marker.
	pub fn silent_boot(&self) {
		*self.boot.lock().unwrap() = None;
	}

	fn with_session<R>(&self, name: &str, f: impl FnOnce(&mut FakeSession) -> R) -> ControlResult<R> {
		self.sessions
			.lock()
			.unwrap()
			.get_mut(name)
			.map(f)
			.ok_or_else(|| ControlError::SessionNotFound(name.to_string()))
	}
}

#[async_trait]
impl Multiplexer for FakeMux {
	async fn list_sessions(&self) -> ControlResult<Vec<TmuxSession>> {
		let sessions = self.sessions.lock().unwrap();
		let mut list: Vec<TmuxSession> = sessions
			.iter()
			.map(|(name, s)| TmuxSession {
				name: name.clone(),
				created_at: None,
				attached: false,
				window_count: 1,
				working_dir: Some(s.working_dir.clone()),
				tagged: true,
			})
			.collect();
		list.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(list)
	}

	async fn has_session(&self, name: &str) -> bool {
		self.sessions.lock().unwrap().contains_key(name)
	}

	async fn create_session(
		&self,
		name: &str,
		working_dir: &Path,
		start_agent: bool,
	) -> ControlResult<String> {
		if *self.fail_create.lock().unwrap() {
			return Err(ControlError::command("tmux new-session", "server exited"));
		}
		let name = sanitize_session_name(name);
		let mut sessions = self.sessions.lock().unwrap();
		if sessions.contains_key(&name) {
			return Err(ControlError::SessionExists(name));
		}
		let pane = if start_agent {
			self.boot.lock().unwrap().clone().unwrap_or_default()
		} else {
			String::new()
		};
		sessions.insert(
			name.clone(),
			FakeSession {
				working_dir: working_dir.to_string_lossy().into_owned(),
				pane,
				keys: Vec::new(),
			},
		);
		Ok(name)
	}

	async fn kill_session(&self, name: &str) -> ControlResult<()> {
		self.sessions
			.lock()
			.unwrap()
			.remove(name)
			.map(|_| ())
			.ok_or_else(|| ControlError::SessionNotFound(name.to_string()))
	}

	async fn send_literal(&self, target: &str, text: &str) -> ControlResult<()> {
		// Deliver in two halves with a yield between, like a pane receiving a
		// large paste, so unserialized writers would interleave.
		let mid = text.char_indices().nth(text.chars().count() / 2).map_or(text.len(), |(i, _)| i);
		self.with_session(target, |s| s.pane.push_str(&text[..mid]))?;
		tokio::task::yield_now().await;
		self.with_session(target, |s| s.pane.push_str(&text[mid..]))
	}

	async fn send_key(&self, target: &str, key: Key) -> ControlResult<()> {
		self.with_session(target, |s| {
			s.keys.push(key.tmux_name().to_string());
			if key == Key::Enter {
				s.pane.push('\n');
			}
		})
	}

	async fn capture_pane(&self, target: &str, lines: usize, _offset: usize) -> ControlResult<String> {
		self.with_session(target, |s| {
			let all: Vec<&str> = s.pane.lines().collect();
			let start = all.len().saturating_sub(lines);
			all[start..].join("\n")
		})
	}
}

#[derive(Default)]
struct VcsState {
	branches: HashSet<String>,
	fail_branches: HashSet<String>,
	merge_outcomes: VecDeque<MergeOutcome>,
	merges: Vec<Vec<String>>,
}

/// Creates real worktree directories with a linked-worktree `.git` file so
/// repository discovery works, but never runs git.
#[derive(Default)]
pub struct FakeVcs {
	state: Mutex<VcsState>,
}

impl FakeVcs {
	pub fn new() -> Self {
		Self::default()
	}

	/// A branch that exists before any worker asks for it.
	pub fn add_branch(&self, branch: &str) {
		self.state.lock().unwrap().branches.insert(branch.to_string());
	}

	pub fn fail_branch(&self, branch: &str) {
		self.state.lock().unwrap().fail_branches.insert(branch.to_string());
	}

	pub fn queue_merge(&self, outcome: MergeOutcome) {
		self.state.lock().unwrap().merge_outcomes.push_back(outcome);
	}

	pub fn has_branch(&self, branch: &str) -> bool {
		self.state.lock().unwrap().branches.contains(branch)
	}

	/// Branch lists passed to each merge, in call order.
	pub fn merges(&self) -> Vec<Vec<String>> {
		self.state.lock().unwrap().merges.clone()
	}
}

#[async_trait]
impl Vcs for FakeVcs {
	async fn create_worktree(&self, repo: &Path, branch: &str, _base: &str) -> ControlResult<PathBuf> {
		let mut state = self.state.lock().unwrap();
		if state.fail_branches.contains(branch) {
			return Err(ControlError::Repository(format!("cannot create {branch}")));
		}
		if state.branches.contains(branch) {
			return Err(ControlError::command(
				"git worktree add",
				format!("fatal: a branch named '{branch}' already exists"),
			));
		}
		let path = worktree_path_for(repo, branch);
		fs::create_dir_all(&path)?;
		let name = path
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_default();
		fs::write(
			path.join(".git"),
			format!("gitdir: {}/.git/worktrees/{name}\n", repo.display()),
		)?;
		state.branches.insert(branch.to_string());
		Ok(path)
	}

	async fn remove_worktree(&self, _repo: &Path, path: &Path) -> ControlResult<()> {
		if path.exists() {
			fs::remove_dir_all(path)?;
		}
		Ok(())
	}

	async fn list_worktrees(&self, repo: &Path) -> ControlResult<Vec<Worktree>> {
		let state = self.state.lock().unwrap();
		let mut list = vec![Worktree {
			path: repo.to_path_buf(),
			branch: Some("main".to_string()),
			is_main: true,
		}];
		list.extend(state.branches.iter().map(|b| Worktree {
			path: worktree_path_for(repo, b),
			branch: Some(b.clone()),
			is_main: false,
		}));
		Ok(list)
	}

	async fn delete_branch(&self, _repo: &Path, branch: &str) -> ControlResult<()> {
		self.state.lock().unwrap().branches.remove(branch);
		Ok(())
	}

	async fn base_branch(&self, _repo: &Path) -> ControlResult<String> {
		Ok("main".to_string())
	}

	async fn commits_between(
		&self,
		_repo: &Path,
		_base: &str,
		branch: &str,
	) -> ControlResult<Vec<CommitSummary>> {
		Ok(vec![CommitSummary {
			sha: "0123456789abcdef".to_string(),
			subject: format!("work on {branch}"),
		}])
	}

	async fn merge_branches(
		&self,
		_repo: &Path,
		_base: &str,
		branches: &[String],
		_message: &str,
	) -> ControlResult<MergeOutcome> {
		let mut state = self.state.lock().unwrap();
		state.merges.push(branches.to_vec());
		Ok(state
			.merge_outcomes
			.pop_front()
			.unwrap_or_else(|| MergeOutcome::Merged {
				commit: "abc123".to_string(),
			}))
	}
}
