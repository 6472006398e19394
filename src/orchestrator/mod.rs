//! Parallel work groups: several agents, each in its own worktree and tmux
//! session, inferred from their output and merged back into one branch.
//!
//! Group state lives behind a plain mutex that is never held across an await.
//! Every mutation goes through [`Orchestrator::mutate`], which persists the
//! whole map before releasing the lock, so readers never see a half-applied
//! change. Slow work (git, tmux, settle delays) happens outside the lock and
//! re-validates state when it comes back.

mod merge;
mod progress;
mod prompt;
mod spawn;

use crate::config::{Config, Timing};
use crate::error::{ControlError, ControlResult};
use crate::git::{worktree_path_for, Vcs};
use crate::injector::InputInjector;
use crate::model::{
	session_id_for_path, GroupStatus, WorkGroup, WorkerQuestion, WorkerSession, WorkerSpec,
	WorkerStatus,
};
use crate::store::GroupStore;
use crate::tmux::{sanitize_session_name, Multiplexer};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Events for notification escalation and connected clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OrchestratorEvent {
	#[serde(rename_all = "camelCase")]
	WorkerWaiting {
		group_id: String,
		worker_id: String,
		task_slug: String,
		question: Option<WorkerQuestion>,
	},
	#[serde(rename_all = "camelCase")]
	WorkerError {
		group_id: String,
		worker_id: String,
		task_slug: String,
		error: String,
	},
	#[serde(rename_all = "camelCase")]
	GroupReadyToMerge { group_id: String, name: String },
	#[serde(rename_all = "camelCase")]
	GroupMerged {
		group_id: String,
		name: String,
		commit: String,
	},
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
	pub branch_prefix: String,
	pub completion_sentinel: String,
	pub ready_markers: Vec<String>,
	pub timing: Timing,
}

impl From<&Config> for OrchestratorSettings {
	fn from(cfg: &Config) -> Self {
		Self {
			branch_prefix: cfg.general.branch_prefix.clone(),
			completion_sentinel: cfg.detection.completion_sentinel.clone(),
			ready_markers: cfg.detection.ready_markers.clone(),
			timing: cfg.timing.clone(),
		}
	}
}

pub struct Orchestrator {
	mux: Arc<dyn Multiplexer>,
	vcs: Arc<dyn Vcs>,
	injector: Arc<InputInjector>,
	store: GroupStore,
	settings: OrchestratorSettings,
	groups: Mutex<HashMap<String, WorkGroup>>,
	/// Workers this process is creating right now; the liveness check skips them.
	spawning: Mutex<HashSet<String>>,
	events: broadcast::Sender<OrchestratorEvent>,
}

impl Orchestrator {
	pub fn new(
		mux: Arc<dyn Multiplexer>,
		vcs: Arc<dyn Vcs>,
		injector: Arc<InputInjector>,
		store: GroupStore,
		settings: OrchestratorSettings,
	) -> Arc<Self> {
		let mut groups = store.load();
		for group in groups.values_mut() {
			if group.status == GroupStatus::Merging {
				warn!(group = %group.id, "merge was interrupted by a restart");
				group.status = GroupStatus::Active;
				group.error = Some("merge interrupted by daemon restart".to_string());
			}
			// Nothing is driving these anymore; as errors they can be retried.
			for worker in group
				.workers
				.iter_mut()
				.filter(|w| w.status == WorkerStatus::Spawning)
			{
				warn!(group = %group.id, worker = %worker.task_slug, "spawn was interrupted by a restart");
				worker.mark_error("spawn interrupted by daemon restart");
			}
			if group.status == GroupStatus::Active
				&& group.all_workers_terminal()
				&& group.completed_workers().next().is_none()
			{
				group.status = GroupStatus::Failed;
				group.error = Some("every worker failed".to_string());
			}
		}
		info!(groups = groups.len(), path = %store.path().display(), "loaded work groups");

		let (events, _) = broadcast::channel(256);
		Arc::new(Self {
			mux,
			vcs,
			injector,
			store,
			settings,
			groups: Mutex::new(groups),
			spawning: Mutex::new(HashSet::new()),
			events,
		})
	}

	pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
		self.events.subscribe()
	}

	fn emit(&self, event: OrchestratorEvent) {
		// No subscribers is fine.
		let _ = self.events.send(event);
	}

	fn lock_groups(&self) -> MutexGuard<'_, HashMap<String, WorkGroup>> {
		self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	fn lock_spawning(&self) -> MutexGuard<'_, HashSet<String>> {
		self.spawning.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Applies `f` to the group map and persists the result before releasing
	/// the lock. A failed write is logged; the mutation itself still stands.
	fn mutate<R>(&self, f: impl FnOnce(&mut HashMap<String, WorkGroup>) -> R) -> R {
		let mut groups = self.lock_groups();
		let result = f(&mut groups);
		if let Err(e) = self.store.save(&groups) {
			error!(error = %e, "failed to persist work groups");
		}
		result
	}

	fn with_group<R>(
		&self,
		group_id: &str,
		f: impl FnOnce(&mut WorkGroup) -> ControlResult<R>,
	) -> ControlResult<R> {
		self.mutate(|groups| {
			let group = groups
				.get_mut(group_id)
				.ok_or_else(|| ControlError::GroupNotFound(group_id.to_string()))?;
			f(group)
		})
	}

	pub fn list_groups(&self) -> Vec<WorkGroup> {
		let mut groups: Vec<WorkGroup> = self.lock_groups().values().cloned().collect();
		groups.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		groups
	}

	pub fn get_group(&self, group_id: &str) -> ControlResult<WorkGroup> {
		self.lock_groups()
			.get(group_id)
			.cloned()
			.ok_or_else(|| ControlError::GroupNotFound(group_id.to_string()))
	}

	/// Registers a group and spawns every worker concurrently. Returns once each
	/// worker is either working or has failed and been cleaned up.
	pub async fn create_group(
		self: &Arc<Self>,
		name: &str,
		foreman_session_id: &str,
		repo: &Path,
		specs: Vec<WorkerSpec>,
	) -> ControlResult<WorkGroup> {
		if specs.is_empty() {
			return Err(ControlError::InvalidState(
				"a work group needs at least one worker".to_string(),
			));
		}
		// Worker session ids must match the resolved paths tmux reports.
		let repo = repo
			.canonicalize()
			.map_err(|e| ControlError::Repository(format!("{}: {e}", repo.display())))?;
		if !repo.is_dir() {
			return Err(ControlError::Repository(format!(
				"repository not found: {}",
				repo.display()
			)));
		}

		let group_id = Uuid::new_v4().to_string();
		let mut seen = HashSet::new();
		let mut workers = Vec::with_capacity(specs.len());
		for spec in specs {
			let slug = slug::slugify(&spec.task_slug);
			if slug.is_empty() || !seen.insert(slug.clone()) {
				return Err(ControlError::InvalidState(format!(
					"task slugs must be unique and non-empty: {:?}",
					spec.task_slug
				)));
			}
			workers.push(self.new_worker(&group_id, &repo, WorkerSpec { task_slug: slug, ..spec }));
		}

		let group = WorkGroup {
			id: group_id.clone(),
			name: name.to_string(),
			foreman_session_id: foreman_session_id.to_string(),
			workers,
			status: GroupStatus::Active,
			created_at: Utc::now(),
			completed_at: None,
			merge_commit: None,
			error: None,
		};
		let worker_ids: Vec<String> = group.workers.iter().map(|w| w.id.clone()).collect();
		self.mutate(|groups| {
			groups.insert(group_id.clone(), group);
		});
		info!(group = %group_id, name, workers = worker_ids.len(), repo = %repo.display(), "created work group");

		let mut tasks = JoinSet::new();
		for worker_id in worker_ids {
			let this = Arc::clone(self);
			let group_id = group_id.clone();
			let repo = repo.clone();
			tasks.spawn(async move { this.spawn_worker(&group_id, &worker_id, &repo).await });
		}
		while let Some(joined) = tasks.join_next().await {
			if let Err(e) = joined {
				error!(group = %group_id, error = %e, "worker spawn task panicked");
			}
		}

		self.check_group_settled(&group_id);
		self.get_group(&group_id)
	}

	fn new_worker(&self, group_id: &str, repo: &Path, spec: WorkerSpec) -> WorkerSession {
		let branch = format!("{}{}", self.settings.branch_prefix, spec.task_slug);
		let worktree_path = worktree_path_for(repo, &branch);
		let short_group: String = group_id.chars().take(8).collect();
		WorkerSession {
			id: Uuid::new_v4().to_string(),
			session_id: session_id_for_path(&worktree_path),
			tmux_session_name: sanitize_session_name(&format!(
				"par-{short_group}-{}",
				spec.task_slug
			)),
			task_slug: spec.task_slug,
			task_description: spec.task_description,
			file_scope: spec.file_scope,
			branch,
			worktree_path,
			status: WorkerStatus::Spawning,
			commits: Vec::new(),
			started_at: Utc::now(),
			completed_at: None,
			last_activity: None,
			last_question: None,
			error: None,
		}
	}

	/// Kills every worker session and removes every worktree and branch,
	/// whatever state the workers are in.
	pub async fn cancel_group(&self, group_id: &str) -> ControlResult<WorkGroup> {
		let workers = self.with_group(group_id, |group| {
			match group.status {
				GroupStatus::Merging => {
					return Err(ControlError::InvalidState(
						"cannot cancel a group while it is merging".to_string(),
					));
				}
				GroupStatus::Completed | GroupStatus::Cancelled => {
					return Err(ControlError::InvalidState(format!(
						"group is already {:?}",
						group.status
					)));
				}
				GroupStatus::Active | GroupStatus::Failed => {}
			}
			for worker in group.workers.iter_mut().filter(|w| !w.status.is_terminal()) {
				worker.mark_error("cancelled");
			}
			group.status = GroupStatus::Cancelled;
			group.completed_at = Some(Utc::now());
			Ok(group.workers.clone())
		})?;

		let repo = self.derive_repo(&workers);
		for worker in &workers {
			self.teardown(worker, repo.as_deref()).await;
		}
		info!(group = %group_id, "cancelled work group");
		self.get_group(group_id)
	}

	/// Forgets a finished group, cleaning up anything its workers left behind.
	pub async fn dismiss_group(&self, group_id: &str) -> ControlResult<()> {
		let workers = {
			let groups = self.lock_groups();
			let group = groups
				.get(group_id)
				.ok_or_else(|| ControlError::GroupNotFound(group_id.to_string()))?;
			if group.status == GroupStatus::Merging {
				return Err(ControlError::InvalidState(
					"cannot dismiss a group while it is merging".to_string(),
				));
			}
			if !group.is_finished() && !group.all_workers_terminal() {
				return Err(ControlError::InvalidState(
					"cancel the group or wait for its workers before dismissing".to_string(),
				));
			}
			group.workers.clone()
		};

		let repo = self.derive_repo(&workers);
		for worker in &workers {
			self.teardown(worker, repo.as_deref()).await;
		}
		self.mutate(|groups| {
			groups.remove(group_id);
		});
		info!(group = %group_id, "dismissed work group");
		Ok(())
	}

	/// Emits ready-to-merge once every worker is terminal, or fails the group
	/// when none of them completed.
	fn check_group_settled(&self, group_id: &str) {
		let event = self.mutate(|groups| {
			let group = groups.get_mut(group_id)?;
			if !group.is_ready_to_merge() {
				return None;
			}
			if group.completed_workers().next().is_none() {
				group.status = GroupStatus::Failed;
				group.error = Some("every worker failed".to_string());
				warn!(group = %group_id, "all workers failed");
				return None;
			}
			Some(OrchestratorEvent::GroupReadyToMerge {
				group_id: group.id.clone(),
				name: group.name.clone(),
			})
		});
		if let Some(event) = event {
			info!(group = %group_id, "work group ready to merge");
			self.emit(event);
		}
	}
}
