use super::{Orchestrator, OrchestratorEvent};
use crate::detection;
use crate::error::ControlError;
use crate::model::{GroupStatus, StatusEvent, WorkerStatus};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A worker matched by session id, copied out of the lock.
struct Matched {
	group_id: String,
	worker_id: String,
	task_slug: String,
	branch: String,
	status: WorkerStatus,
}

impl Orchestrator {
	fn find_live_worker(&self, session_id: &str) -> Option<Matched> {
		let groups = self.lock_groups();
		groups
			.values()
			.filter(|g| g.status == GroupStatus::Active)
			.find_map(|g| {
				g.workers
					.iter()
					.find(|w| {
						w.session_id == session_id
							&& matches!(w.status, WorkerStatus::Working | WorkerStatus::Waiting)
					})
					.map(|w| Matched {
						group_id: g.id.clone(),
						worker_id: w.id.clone(),
						task_slug: w.task_slug.clone(),
						branch: w.branch.clone(),
						status: w.status,
					})
			})
	}

	/// Folds one status event into worker state. Events for sessions that are
	/// not a live worker are ignored.
	pub async fn handle_status_event(&self, event: &StatusEvent) {
		let Some(matched) = self.find_live_worker(&event.session_id) else {
			return;
		};

		if !event.is_waiting_for_input {
			let activity = event.current_activity.clone();
			let _ = self.with_group(&matched.group_id, |group| {
				if let Some(w) = group.worker_mut(&matched.worker_id) {
					if w.status == WorkerStatus::Waiting {
						w.status = WorkerStatus::Working;
						w.last_question = None;
					}
					if activity.is_some() {
						w.last_activity = activity;
					}
				}
				Ok(())
			});
			return;
		}

		let content = event
			.last_message
			.as_ref()
			.map(|m| m.content.as_str())
			.unwrap_or_default();

		if detection::is_completion(content, &self.settings.completion_sentinel) {
			self.complete_worker(&matched).await;
			return;
		}

		if matched.status == WorkerStatus::Waiting {
			// Same question still on screen.
			return;
		}
		let question = (!content.trim().is_empty()).then(|| detection::extract_question(content));
		let changed = self
			.with_group(&matched.group_id, |group| {
				Ok(match group.worker_mut(&matched.worker_id) {
					Some(w) if w.status == WorkerStatus::Working => {
						w.status = WorkerStatus::Waiting;
						w.last_question = question.clone();
						true
					}
					_ => false,
				})
			})
			.unwrap_or(false);
		if changed {
			info!(group = %matched.group_id, worker = %matched.task_slug, "worker waiting for input");
			self.emit(OrchestratorEvent::WorkerWaiting {
				group_id: matched.group_id.clone(),
				worker_id: matched.worker_id.clone(),
				task_slug: matched.task_slug.clone(),
				question,
			});
		}
	}

	async fn complete_worker(&self, matched: &Matched) {
		let workers = match self.get_group(&matched.group_id) {
			Ok(group) => group.workers,
			Err(_) => return,
		};
		let commits = match self.derive_repo(&workers) {
			Some(repo) => {
				let base = self.vcs.base_branch(&repo).await;
				match base {
					Ok(base) => self
						.vcs
						.commits_between(&repo, &base, &matched.branch)
						.await
						.unwrap_or_else(|e| {
							warn!(branch = %matched.branch, error = %e, "failed to list worker commits");
							Vec::new()
						}),
					Err(e) => {
						warn!(error = %e, "failed to resolve base branch");
						Vec::new()
					}
				}
			}
			None => Vec::new(),
		};

		let completed = self
			.with_group(&matched.group_id, |group| {
				Ok(match group.worker_mut(&matched.worker_id) {
					Some(w) if !w.status.is_terminal() && w.status != WorkerStatus::Spawning => {
						w.status = WorkerStatus::Completed;
						w.commits = commits;
						w.completed_at = Some(Utc::now());
						w.last_question = None;
						true
					}
					_ => false,
				})
			})
			.unwrap_or(false);
		if completed {
			info!(group = %matched.group_id, worker = %matched.task_slug, "worker completed");
			self.check_group_settled(&matched.group_id);
		}
	}

	/// One liveness pass: any non-terminal worker whose session has vanished is
	/// marked errored. Workers still being spawned by this process are skipped.
	pub async fn monitor_tick(&self) {
		let candidates: Vec<(String, String, String, String)> = {
			let groups = self.lock_groups();
			let spawning = self.lock_spawning();
			groups
				.values()
				.filter(|g| g.status == GroupStatus::Active)
				.flat_map(|g| {
					g.workers
						.iter()
						.filter(|w| !w.status.is_terminal() && !spawning.contains(&w.id))
						.map(|w| {
							(
								g.id.clone(),
								w.id.clone(),
								w.task_slug.clone(),
								w.tmux_session_name.clone(),
							)
						})
				})
				.collect()
		};

		for (group_id, worker_id, task_slug, session) in candidates {
			if self.mux.has_session(&session).await {
				continue;
			}
			let message = ControlError::WorkerDead(session.clone()).to_string();
			let marked = self
				.with_group(&group_id, |group| {
					if group.status != GroupStatus::Active {
						return Ok(false);
					}
					Ok(match group.worker_mut(&worker_id) {
						Some(w) if !w.status.is_terminal() => {
							w.mark_error(message.clone());
							true
						}
						_ => false,
					})
				})
				.unwrap_or(false);
			if !marked {
				continue;
			}
			warn!(group = %group_id, worker = %task_slug, session = %session, "worker session died");
			self.emit(OrchestratorEvent::WorkerError {
				group_id: group_id.clone(),
				worker_id,
				task_slug,
				error: message,
			});
			self.check_group_settled(&group_id);
		}
	}

	pub async fn run_monitor(self: Arc<Self>) {
		let mut ticker = interval(self.settings.timing.monitor_interval());
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			self.monitor_tick().await;
		}
	}

	/// Consumes status events until the producer goes away.
	pub async fn run_event_loop(self: Arc<Self>, mut rx: broadcast::Receiver<StatusEvent>) {
		loop {
			match rx.recv().await {
				Ok(event) => self.handle_status_event(&event).await,
				Err(broadcast::error::RecvError::Lagged(n)) => {
					warn!(skipped = n, "status consumer lagged");
				}
				Err(broadcast::error::RecvError::Closed) => {
					debug!("status channel closed");
					return;
				}
			}
		}
	}
}
