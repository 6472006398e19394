use super::prompt::worker_prompt;
use super::{Orchestrator, OrchestratorEvent};
use crate::detection;
use crate::error::{ControlError, ControlResult};
use crate::git::{repo_root_from_worktree, repo_from_worktree_name};
use crate::model::{GroupStatus, WorkGroup, WorkerSession, WorkerStatus};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Resources created so far for one spawn attempt, torn down on failure.
#[derive(Default)]
struct Partial {
	worktree: Option<PathBuf>,
	/// Set only once this attempt has created the branch; an existing branch of
	/// the same name is never ours to delete.
	branch: Option<String>,
	session: Option<String>,
}

impl Orchestrator {
	/// Worktree, session, ready wait, prompt. Any failure marks the worker as
	/// errored after removing whatever was already created.
	pub(super) async fn spawn_worker(&self, group_id: &str, worker_id: &str, repo: &Path) {
		self.lock_spawning().insert(worker_id.to_string());
		let mut partial = Partial::default();
		let result = self.try_spawn(group_id, worker_id, repo, &mut partial).await;
		self.lock_spawning().remove(worker_id);

		let worker = match self.get_group(group_id).ok().and_then(|g| g.worker(worker_id).cloned()) {
			Some(worker) => worker,
			None => {
				self.rollback(&partial, repo).await;
				return;
			}
		};

		match result {
			Ok(()) => {
				let started = self
					.with_group(group_id, |group| {
						Ok(match group.worker_mut(worker_id) {
							Some(w) if w.status == WorkerStatus::Spawning => {
								w.status = WorkerStatus::Working;
								w.last_activity = Some("started".to_string());
								true
							}
							_ => false,
						})
					})
					.unwrap_or(false);
				if !started {
					// Cancelled while we were still creating things.
					debug!(worker = %worker_id, "worker left spawning state mid-spawn, cleaning up");
					self.rollback(&partial, repo).await;
					return;
				}
				info!(group = %group_id, worker = %worker.task_slug, session = %worker.tmux_session_name, "worker started");
			}
			Err(e) => {
				warn!(group = %group_id, worker = %worker.task_slug, error = %e, "worker spawn failed");
				self.rollback(&partial, repo).await;
				let message = e.to_string();
				let marked = self
					.with_group(group_id, |group| {
						Ok(match group.worker_mut(worker_id) {
							Some(w) if !w.status.is_terminal() => {
								w.mark_error(message.clone());
								true
							}
							_ => false,
						})
					})
					.unwrap_or(false);
				if marked {
					self.emit(OrchestratorEvent::WorkerError {
						group_id: group_id.to_string(),
						worker_id: worker_id.to_string(),
						task_slug: worker.task_slug.clone(),
						error: message,
					});
				}
			}
		}
	}

	async fn try_spawn(
		&self,
		group_id: &str,
		worker_id: &str,
		repo: &Path,
		partial: &mut Partial,
	) -> ControlResult<()> {
		let worker = self
			.get_group(group_id)?
			.worker(worker_id)
			.cloned()
			.ok_or_else(|| ControlError::WorkerNotFound(worker_id.to_string()))?;
		let spawn_error = |e: ControlError| ControlError::SpawnFailure {
			slug: worker.task_slug.clone(),
			message: e.to_string(),
		};

		let base = self.vcs.base_branch(repo).await.map_err(spawn_error)?;
		let path = self
			.vcs
			.create_worktree(repo, &worker.branch, &base)
			.await
			.map_err(spawn_error)?;
		partial.worktree = Some(path.clone());
		partial.branch = Some(worker.branch.clone());

		let session = self
			.mux
			.create_session(&worker.tmux_session_name, &path, true)
			.await
			.map_err(spawn_error)?;
		partial.session = Some(session.clone());

		self.wait_until_ready(&session).await;

		let prompt = worker_prompt(
			&worker.spec(),
			&worker.branch,
			&self.settings.completion_sentinel,
		);
		self.injector
			.send_input(&prompt, Some(&session))
			.await
			.map_err(spawn_error)?;
		Ok(())
	}

	/// Polls the pane for the agent's ready marker. Proceeds on timeout: a
	/// prompt typed a little early is still better than a stuck worker.
	async fn wait_until_ready(&self, session: &str) {
		let deadline = Instant::now() + self.settings.timing.ready_timeout();
		loop {
			if let Ok(pane) = self.mux.capture_pane(session, 50, 0).await {
				if detection::is_ready(&pane, &self.settings.ready_markers) {
					return;
				}
			}
			if Instant::now() >= deadline {
				warn!(session, "agent did not report ready in time, sending prompt anyway");
				return;
			}
			sleep(self.settings.timing.ready_poll()).await;
		}
	}

	async fn rollback(&self, partial: &Partial, repo: &Path) {
		if let Some(session) = &partial.session {
			if let Err(e) = self.mux.kill_session(session).await {
				warn!(session = %session, error = %e, "failed to kill session during rollback");
			}
		}
		if let Some(path) = &partial.worktree {
			if let Err(e) = self.vcs.remove_worktree(repo, path).await {
				warn!(path = %path.display(), error = %e, "failed to remove worktree during rollback");
			}
		}
		if let Some(branch) = &partial.branch {
			if let Err(e) = self.vcs.delete_branch(repo, branch).await {
				warn!(branch = %branch, error = %e, "failed to delete branch during rollback");
			}
		}
	}

	/// Kills the worker's session and removes its worktree and branch. Missing
	/// pieces are skipped.
	pub(super) async fn teardown(&self, worker: &WorkerSession, repo: Option<&Path>) {
		if self.mux.has_session(&worker.tmux_session_name).await {
			if let Err(e) = self.mux.kill_session(&worker.tmux_session_name).await {
				warn!(session = %worker.tmux_session_name, error = %e, "failed to kill worker session");
			}
		}
		let Some(repo) = repo else {
			warn!(worker = %worker.task_slug, "repository unknown, leaving worktree and branch");
			return;
		};
		if worker.worktree_path.exists() {
			if let Err(e) = self.vcs.remove_worktree(repo, &worker.worktree_path).await {
				warn!(path = %worker.worktree_path.display(), error = %e, "failed to remove worktree");
			}
		}
		if let Err(e) = self.vcs.delete_branch(repo, &worker.branch).await {
			warn!(branch = %worker.branch, error = %e, "failed to delete branch");
		}
	}

	/// The main repository, read from the `.git` file of any worker's worktree,
	/// else inferred from the worktree naming scheme.
	pub(super) fn derive_repo(&self, workers: &[WorkerSession]) -> Option<PathBuf> {
		workers
			.iter()
			.find_map(|w| repo_root_from_worktree(&w.worktree_path).ok())
			.or_else(|| {
				workers
					.iter()
					.filter_map(|w| repo_from_worktree_name(&w.worktree_path, &w.branch))
					.find(|repo| repo.is_dir())
			})
	}

	/// Re-spawns an errored worker with its original task, on fresh resources.
	pub async fn retry_worker(
		&self,
		group_id: &str,
		worker_id: &str,
	) -> ControlResult<WorkGroup> {
		let group = self.get_group(group_id)?;
		let worker = group
			.worker(worker_id)
			.cloned()
			.ok_or_else(|| ControlError::WorkerNotFound(worker_id.to_string()))?;
		if worker.status != WorkerStatus::Error {
			return Err(ControlError::InvalidState(format!(
				"only errored workers can be retried (worker is {:?})",
				worker.status
			)));
		}
		if !matches!(group.status, GroupStatus::Active | GroupStatus::Failed) {
			return Err(ControlError::InvalidState(format!(
				"cannot retry a worker in a {:?} group",
				group.status
			)));
		}

		// Siblings first: this worker's own worktree may be half gone.
		let siblings: Vec<WorkerSession> = group
			.workers
			.iter()
			.filter(|w| w.id != worker_id)
			.cloned()
			.collect();
		let repo = self
			.derive_repo(&siblings)
			.or_else(|| self.derive_repo(std::slice::from_ref(&worker)))
			.ok_or_else(|| {
				ControlError::Repository("cannot locate the group's repository".to_string())
			})?;

		self.teardown(&worker, Some(&repo)).await;

		self.with_group(group_id, |group| {
			group.status = GroupStatus::Active;
			group.error = None;
			let w = group
				.worker_mut(worker_id)
				.ok_or_else(|| ControlError::WorkerNotFound(worker_id.to_string()))?;
			if w.status != WorkerStatus::Error {
				return Err(ControlError::InvalidState(
					"worker changed state before retry".to_string(),
				));
			}
			w.status = WorkerStatus::Spawning;
			w.error = None;
			w.commits.clear();
			w.started_at = Utc::now();
			w.completed_at = None;
			w.last_activity = None;
			w.last_question = None;
			Ok(())
		})?;
		info!(group = %group_id, worker = %worker.task_slug, repo = %repo.display(), "retrying worker");

		self.spawn_worker(group_id, worker_id, &repo).await;
		self.check_group_settled(group_id);
		self.get_group(group_id)
	}
}
