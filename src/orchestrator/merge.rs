use super::{Orchestrator, OrchestratorEvent};
use crate::error::{ControlError, ControlResult};
use crate::git::MergeOutcome;
use crate::model::{GroupStatus, WorkerSession};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
	pub commit: String,
	pub merged_branches: Vec<String>,
}

impl Orchestrator {
	/// Merges every completed worker's branch into the base branch in one
	/// commit. On conflict the repository is left as it was and the group goes
	/// back to active so the foreman can resolve and try again.
	pub async fn merge_group(&self, group_id: &str) -> ControlResult<MergeReport> {
		let (name, completed) = self.with_group(group_id, |group| {
			if !group.is_ready_to_merge() {
				return Err(ControlError::InvalidState(format!(
					"group is not ready to merge (status {:?}, {} of {} workers finished)",
					group.status,
					group.workers.iter().filter(|w| w.status.is_terminal()).count(),
					group.workers.len()
				)));
			}
			let completed: Vec<WorkerSession> = group.completed_workers().cloned().collect();
			if completed.is_empty() {
				return Err(ControlError::InvalidState(
					"no completed workers to merge".to_string(),
				));
			}
			group.status = GroupStatus::Merging;
			group.error = None;
			Ok((group.name.clone(), completed))
		})?;

		match self.run_merge(group_id, &name, &completed).await {
			Ok(report) => Ok(report),
			Err(e) => {
				let message = e.to_string();
				let _ = self.with_group(group_id, |group| {
					group.status = GroupStatus::Active;
					group.error = Some(message);
					Ok(())
				});
				Err(e)
			}
		}
	}

	async fn run_merge(
		&self,
		group_id: &str,
		name: &str,
		completed: &[WorkerSession],
	) -> ControlResult<MergeReport> {
		let repo = self.derive_repo(completed).ok_or_else(|| {
			ControlError::Repository("cannot locate the group's repository".to_string())
		})?;
		let base = self.vcs.base_branch(&repo).await?;
		let branches: Vec<String> = completed.iter().map(|w| w.branch.clone()).collect();
		let message = format!(
			"Merge work group '{name}': {}",
			completed
				.iter()
				.map(|w| w.task_slug.as_str())
				.collect::<Vec<_>>()
				.join(", ")
		);

		// Worktrees keep their branches checked out; the merge itself runs in the
		// main checkout so that does not get in the way.
		let commit = match self
			.vcs
			.merge_branches(&repo, &base, &branches, &message)
			.await?
		{
			MergeOutcome::Merged { commit } => commit,
			MergeOutcome::Conflict { files } => {
				warn!(group = %group_id, ?files, "work group merge conflicted");
				return Err(ControlError::MergeConflict { files });
			}
		};

		for worker in completed {
			self.teardown(worker, Some(&repo)).await;
		}

		self.with_group(group_id, |group| {
			group.status = GroupStatus::Completed;
			group.merge_commit = Some(commit.clone());
			group.completed_at = Some(Utc::now());
			group.error = None;
			Ok(())
		})?;
		info!(group = %group_id, %commit, branches = branches.len(), "merged work group");
		self.emit(OrchestratorEvent::GroupMerged {
			group_id: group_id.to_string(),
			name: name.to_string(),
			commit: commit.clone(),
		});

		Ok(MergeReport {
			commit,
			merged_branches: branches,
		})
	}
}
