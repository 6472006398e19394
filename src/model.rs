use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
	Spawning,
	Working,
	Waiting,
	Completed,
	Error,
}

impl WorkerStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, WorkerStatus::Completed | WorkerStatus::Error)
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
	Active,
	Merging,
	Completed,
	Failed,
	Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitSummary {
	pub sha: String,
	pub subject: String,
}

/// A question scraped from a worker's last message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerQuestion {
	pub prompt: String,
	#[serde(default)]
	pub options: Vec<String>,
}

/// What the caller asks for when adding a worker to a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
	pub task_slug: String,
	pub task_description: String,
	#[serde(default)]
	pub file_scope: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSession {
	pub id: String,
	pub session_id: String,
	pub tmux_session_name: String,
	pub task_slug: String,
	pub task_description: String,
	#[serde(default)]
	pub file_scope: Vec<String>,
	pub branch: String,
	pub worktree_path: PathBuf,
	pub status: WorkerStatus,
	#[serde(default)]
	pub commits: Vec<CommitSummary>,
	pub started_at: DateTime<Utc>,
	#[serde(default)]
	pub completed_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub last_activity: Option<String>,
	#[serde(default)]
	pub last_question: Option<WorkerQuestion>,
	#[serde(default)]
	pub error: Option<String>,
}

impl WorkerSession {
	pub fn spec(&self) -> WorkerSpec {
		WorkerSpec {
			task_slug: self.task_slug.clone(),
			task_description: self.task_description.clone(),
			file_scope: self.file_scope.clone(),
		}
	}

	pub fn mark_error(&mut self, message: impl Into<String>) {
		self.status = WorkerStatus::Error;
		self.error = Some(message.into());
		self.completed_at = Some(Utc::now());
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkGroup {
	pub id: String,
	pub name: String,
	pub foreman_session_id: String,
	pub workers: Vec<WorkerSession>,
	pub status: GroupStatus,
	pub created_at: DateTime<Utc>,
	#[serde(default)]
	pub completed_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub merge_commit: Option<String>,
	#[serde(default)]
	pub error: Option<String>,
}

impl WorkGroup {
	pub fn all_workers_terminal(&self) -> bool {
		!self.workers.is_empty() && self.workers.iter().all(|w| w.status.is_terminal())
	}

	pub fn is_ready_to_merge(&self) -> bool {
		self.status == GroupStatus::Active && self.all_workers_terminal()
	}

	pub fn is_finished(&self) -> bool {
		matches!(
			self.status,
			GroupStatus::Completed | GroupStatus::Failed | GroupStatus::Cancelled
		)
	}

	pub fn worker(&self, worker_id: &str) -> Option<&WorkerSession> {
		self.workers.iter().find(|w| w.id == worker_id)
	}

	pub fn worker_mut(&mut self, worker_id: &str) -> Option<&mut WorkerSession> {
		self.workers.iter_mut().find(|w| w.id == worker_id)
	}

	pub fn completed_workers(&self) -> impl Iterator<Item = &WorkerSession> {
		self.workers
			.iter()
			.filter(|w| w.status == WorkerStatus::Completed)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastMessage {
	pub content: String,
}

/// Status update for one agent session, as produced by a transcript or pane watcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
	pub session_id: String,
	pub is_waiting_for_input: bool,
	#[serde(default)]
	pub last_message: Option<LastMessage>,
	#[serde(default)]
	pub current_activity: Option<String>,
}

/// Session id a watcher assigns to an agent running in `path`. Workers are looked
/// up by this key, so every producer and consumer must derive it here.
pub fn session_id_for_path(path: &Path) -> String {
	path.to_string_lossy().replace(['/', '_'], "-")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn worker_with(status: WorkerStatus) -> WorkerSession {
		WorkerSession {
			id: "w".to_string(),
			session_id: "s".to_string(),
			tmux_session_name: "t".to_string(),
			task_slug: "slug".to_string(),
			task_description: "desc".to_string(),
			file_scope: vec![],
			branch: "parallel/slug".to_string(),
			worktree_path: PathBuf::from("/tmp/repo-wt-parallel-slug"),
			status,
			commits: vec![],
			started_at: Utc::now(),
			completed_at: None,
			last_activity: None,
			last_question: None,
			error: None,
		}
	}

	fn group_with(statuses: &[WorkerStatus]) -> WorkGroup {
		WorkGroup {
			id: "g".to_string(),
			name: "group".to_string(),
			foreman_session_id: "foreman".to_string(),
			workers: statuses.iter().map(|s| worker_with(*s)).collect(),
			status: GroupStatus::Active,
			created_at: Utc::now(),
			completed_at: None,
			merge_commit: None,
			error: None,
		}
	}

	#[test]
	fn test_ready_when_every_worker_terminal() {
		let group = group_with(&[
			WorkerStatus::Completed,
			WorkerStatus::Error,
			WorkerStatus::Error,
		]);
		assert!(group.is_ready_to_merge());
	}

	#[test]
	fn test_not_ready_with_live_worker() {
		for live in [
			WorkerStatus::Working,
			WorkerStatus::Waiting,
			WorkerStatus::Spawning,
		] {
			let group = group_with(&[WorkerStatus::Completed, live]);
			assert!(!group.is_ready_to_merge(), "{live:?} should block merge");
		}
	}

	#[test]
	fn test_empty_group_is_not_ready() {
		assert!(!group_with(&[]).is_ready_to_merge());
	}

	#[test]
	fn test_session_id_for_path() {
		assert_eq!(
			session_id_for_path(Path::new("/Users/me/my_repo-wt-parallel-fix")),
			"-Users-me-my-repo-wt-parallel-fix"
		);
	}

	#[test]
	fn test_status_event_wire_shape() {
		let json = r#"{"sessionId":"-a-b","isWaitingForInput":true,"lastMessage":{"content":"hi"}}"#;
		let event: StatusEvent = serde_json::from_str(json).unwrap();
		assert_eq!(event.session_id, "-a-b");
		assert!(event.is_waiting_for_input);
		assert_eq!(event.last_message.unwrap().content, "hi");
		assert!(event.current_activity.is_none());
	}
}
