//! Snapshot persistence for work groups.
//!
//! The whole group map is written to one JSON file after every mutation. The
//! file is unversioned: anything that fails to parse is set aside and the daemon
//! starts from an empty map.

use crate::error::{ControlError, ControlResult};
use crate::model::WorkGroup;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub struct GroupStore {
	path: PathBuf,
}

impl GroupStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn load(&self) -> HashMap<String, WorkGroup> {
		let json = match fs::read_to_string(&self.path) {
			Ok(json) => json,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
			Err(e) => {
				warn!(path = %self.path.display(), error = %e, "failed to read work group state");
				return HashMap::new();
			}
		};

		match serde_json::from_str::<Vec<WorkGroup>>(&json) {
			Ok(groups) => groups.into_iter().map(|g| (g.id.clone(), g)).collect(),
			Err(e) => {
				let discarded = self.path.with_extension("json.discarded");
				warn!(
					path = %self.path.display(),
					error = %e,
					moved_to = %discarded.display(),
					"incompatible work group state, starting fresh"
				);
				let _ = fs::rename(&self.path, &discarded);
				HashMap::new()
			}
		}
	}

	/// Writes through a temp file so a crash mid-write never truncates the snapshot.
	pub fn save(&self, groups: &HashMap<String, WorkGroup>) -> ControlResult<()> {
		let mut ordered: Vec<&WorkGroup> = groups.values().collect();
		ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

		let json = serde_json::to_string_pretty(&ordered)
			.map_err(|e| ControlError::Persistence(e.to_string()))?;
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent)
				.map_err(|e| ControlError::Persistence(format!("{}: {e}", parent.display())))?;
		}
		let tmp = self.path.with_extension("json.tmp");
		fs::write(&tmp, json)
			.and_then(|_| fs::rename(&tmp, &self.path))
			.map_err(|e| ControlError::Persistence(format!("{}: {e}", self.path.display())))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{GroupStatus, WorkerSession, WorkerStatus};
	use chrono::Utc;
	use tempfile::TempDir;

	fn setup_test_store() -> (TempDir, GroupStore) {
		let temp_dir = TempDir::new().unwrap();
		let store = GroupStore::new(temp_dir.path().join("state").join("workgroups.json"));
		(temp_dir, store)
	}

	fn sample_group(id: &str) -> WorkGroup {
		WorkGroup {
			id: id.to_string(),
			name: "refactor".to_string(),
			foreman_session_id: "-src-app".to_string(),
			workers: vec![WorkerSession {
				id: "w1".to_string(),
				session_id: "-src-app-wt-parallel-api".to_string(),
				tmux_session_name: "worker-api".to_string(),
				task_slug: "api".to_string(),
				task_description: "Split the API module".to_string(),
				file_scope: vec!["src/api".to_string()],
				branch: "parallel/api".to_string(),
				worktree_path: PathBuf::from("/src/app-wt-parallel-api"),
				status: WorkerStatus::Waiting,
				commits: vec![],
				started_at: Utc::now(),
				completed_at: None,
				last_activity: Some("Editing".to_string()),
				last_question: None,
				error: None,
			}],
			status: GroupStatus::Active,
			created_at: Utc::now(),
			completed_at: None,
			merge_commit: None,
			error: None,
		}
	}

	#[test]
	fn test_missing_file_loads_empty() {
		let (_temp, store) = setup_test_store();
		assert!(store.load().is_empty());
	}

	#[test]
	fn test_save_and_reload_round_trip() {
		let (_temp, store) = setup_test_store();
		let mut groups = HashMap::new();
		groups.insert("g1".to_string(), sample_group("g1"));
		groups.insert("g2".to_string(), sample_group("g2"));

		store.save(&groups).unwrap();
		let loaded = store.load();
		assert_eq!(loaded, groups);
	}

	#[test]
	fn test_incompatible_file_is_discarded() {
		let (_temp, store) = setup_test_store();
		fs::create_dir_all(store.path().parent().unwrap()).unwrap();
		fs::write(store.path(), r#"{"version": 99, "groups": "nope"}"#).unwrap();

		assert!(store.load().is_empty());
		assert!(!store.path().exists());
		assert!(store.path().with_extension("json.discarded").exists());
	}
}
