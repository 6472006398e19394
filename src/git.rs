use crate::error::{ControlError, ControlResult};
use crate::model::CommitSummary;
use crate::process::{self, CommandOutput};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Worktree {
	pub path: PathBuf,
	pub branch: Option<String>,
	pub is_main: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
	Merged { commit: String },
	Conflict { files: Vec<String> },
}

#[async_trait]
pub trait Vcs: Send + Sync {
	/// Adds a worktree on a new `branch` forked from `base` and returns its path.
	async fn create_worktree(&self, repo: &Path, branch: &str, base: &str) -> ControlResult<PathBuf>;

	async fn remove_worktree(&self, repo: &Path, path: &Path) -> ControlResult<()>;

	async fn list_worktrees(&self, repo: &Path) -> ControlResult<Vec<Worktree>>;

	async fn delete_branch(&self, repo: &Path, branch: &str) -> ControlResult<()>;

	/// `main` when it exists, otherwise `master`.
	async fn base_branch(&self, repo: &Path) -> ControlResult<String>;

	async fn commits_between(
		&self,
		repo: &Path,
		base: &str,
		branch: &str,
	) -> ControlResult<Vec<CommitSummary>>;

	/// Merges every branch into `base` in one commit. Conflicts are aborted
	/// before returning, leaving `base` untouched.
	async fn merge_branches(
		&self,
		repo: &Path,
		base: &str,
		branches: &[String],
		message: &str,
	) -> ControlResult<MergeOutcome>;
}

pub struct Git {
	timeout: Duration,
}

impl Git {
	pub fn new(timeout: Duration) -> Self {
		Self { timeout }
	}

	async fn git<I, S>(&self, repo: &Path, args: I) -> ControlResult<CommandOutput>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<std::ffi::OsStr>,
	{
		if !repo.exists() {
			return Err(ControlError::Repository(format!(
				"path does not exist: {}",
				repo.display()
			)));
		}
		process::run("git", args, Some(repo), self.timeout).await
	}

	async fn branch_exists(&self, repo: &Path, branch: &str) -> bool {
		let reference = format!("refs/heads/{branch}");
		match self
			.git(repo, ["rev-parse", "--verify", "--quiet", reference.as_str()])
			.await
		{
			Ok(out) => out.success,
			Err(_) => false,
		}
	}

	async fn unmerged_files(&self, repo: &Path) -> Vec<String> {
		match self
			.git(repo, ["diff", "--name-only", "--diff-filter=U"])
			.await
		{
			Ok(out) if out.success => non_empty_lines(&out.stdout),
			_ => Vec::new(),
		}
	}

	/// Files touched by more than one branch since it forked from `base`. Used
	/// when the octopus strategy refuses to merge without recording conflicts.
	async fn overlapping_files(&self, repo: &Path, base: &str, branches: &[String]) -> Vec<String> {
		let mut counts: HashMap<String, usize> = HashMap::new();
		for branch in branches {
			let range = format!("{base}...{branch}");
			if let Ok(out) = self.git(repo, ["diff", "--name-only", range.as_str()]).await {
				for file in non_empty_lines(&out.stdout) {
					*counts.entry(file).or_default() += 1;
				}
			}
		}
		let mut files: Vec<String> = counts
			.into_iter()
			.filter(|(_, n)| *n > 1)
			.map(|(f, _)| f)
			.collect();
		files.sort();
		files
	}

	async fn abort_merge(&self, repo: &Path) {
		let aborted = matches!(self.git(repo, ["merge", "--abort"]).await, Ok(out) if out.success);
		if !aborted {
			if let Err(e) = self
				.git(repo, ["reset", "--merge"])
				.await
				.and_then(|out| out.check("git reset --merge"))
			{
				warn!(repo = %repo.display(), error = %e, "failed to roll back merge");
			}
		}
	}
}

#[async_trait]
impl Vcs for Git {
	async fn create_worktree(&self, repo: &Path, branch: &str, base: &str) -> ControlResult<PathBuf> {
		let path = worktree_path_for(repo, branch);
		if path.exists() {
			return Err(ControlError::Repository(format!(
				"worktree path already exists: {}",
				path.display()
			)));
		}
		let path_arg = path.to_string_lossy().into_owned();
		self.git(
			repo,
			["worktree", "add", "-b", branch, path_arg.as_str(), base],
		)
		.await?
		.check("git worktree add")?;
		info!(repo = %repo.display(), branch, path = %path.display(), "created worktree");
		Ok(path)
	}

	async fn remove_worktree(&self, repo: &Path, path: &Path) -> ControlResult<()> {
		let path_arg = path.to_string_lossy().into_owned();
		let out = self
			.git(repo, ["worktree", "remove", "--force", path_arg.as_str()])
			.await?;
		if !out.success {
			if path.exists() {
				return out.check("git worktree remove").map(|_| ());
			}
			// Directory already gone; drop git's stale bookkeeping.
			self.git(repo, ["worktree", "prune"]).await?;
		}
		Ok(())
	}

	async fn list_worktrees(&self, repo: &Path) -> ControlResult<Vec<Worktree>> {
		let out = self
			.git(repo, ["worktree", "list", "--porcelain"])
			.await?
			.check("git worktree list")?;
		Ok(parse_worktree_porcelain(&out.stdout))
	}

	async fn delete_branch(&self, repo: &Path, branch: &str) -> ControlResult<()> {
		if !self.branch_exists(repo, branch).await {
			return Ok(());
		}
		self.git(repo, ["branch", "-D", branch])
			.await?
			.check("git branch -D")?;
		Ok(())
	}

	async fn base_branch(&self, repo: &Path) -> ControlResult<String> {
		for candidate in ["main", "master"] {
			if self.branch_exists(repo, candidate).await {
				return Ok(candidate.to_string());
			}
		}
		Err(ControlError::Repository(format!(
			"could not find main or master branch in {}",
			repo.display()
		)))
	}

	async fn commits_between(
		&self,
		repo: &Path,
		base: &str,
		branch: &str,
	) -> ControlResult<Vec<CommitSummary>> {
		let range = format!("{base}..{branch}");
		let out = self
			.git(repo, ["log", "--format=%H%x09%s", range.as_str()])
			.await?
			.check("git log")?;
		Ok(out
			.stdout
			.lines()
			.filter_map(|line| {
				let (sha, subject) = line.split_once('\t')?;
				Some(CommitSummary {
					sha: sha.to_string(),
					subject: subject.to_string(),
				})
			})
			.collect())
	}

	async fn merge_branches(
		&self,
		repo: &Path,
		base: &str,
		branches: &[String],
		message: &str,
	) -> ControlResult<MergeOutcome> {
		if branches.is_empty() {
			return Err(ControlError::InvalidState("no branches to merge".to_string()));
		}
		self.git(repo, ["checkout", base])
			.await?
			.check("git checkout")?;

		let mut args: Vec<&str> = vec!["merge", "--no-ff", "--no-edit", "-m", message];
		args.extend(branches.iter().map(String::as_str));
		let out = self.git(repo, args).await?;

		if out.success {
			let head = self
				.git(repo, ["rev-parse", "HEAD"])
				.await?
				.check("git rev-parse")?;
			let commit = head.stdout.trim().to_string();
			info!(repo = %repo.display(), %commit, branches = branches.len(), "merged branches");
			return Ok(MergeOutcome::Merged { commit });
		}

		let mut files = self.unmerged_files(repo).await;
		self.abort_merge(repo).await;
		if files.is_empty() {
			files = self.overlapping_files(repo, base, branches).await;
		}
		if files.is_empty() {
			let detail = if out.stderr.trim().is_empty() {
				out.stdout.trim().to_string()
			} else {
				out.stderr.trim().to_string()
			};
			return Err(ControlError::command("git merge", detail));
		}
		warn!(repo = %repo.display(), files = ?files, "merge conflict, rolled back");
		Ok(MergeOutcome::Conflict { files })
	}
}

/// `<parent>/<repo-name>-wt-<branch>`, with `/` in the branch flattened.
pub fn worktree_path_for(repo: &Path, branch: &str) -> PathBuf {
	let name = repo
		.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_else(|| "repo".to_string());
	let flat_branch = branch.replace('/', "-");
	let dir = format!("{name}-wt-{flat_branch}");
	match repo.parent() {
		Some(parent) => parent.join(dir),
		None => PathBuf::from(dir),
	}
}

/// Inverse of [`worktree_path_for`], for when the worktree itself is gone.
pub fn repo_from_worktree_name(worktree: &Path, branch: &str) -> Option<PathBuf> {
	let name = worktree.file_name()?.to_str()?;
	let suffix = format!("-wt-{}", branch.replace('/', "-"));
	let repo_name = name.strip_suffix(suffix.as_str())?;
	if repo_name.is_empty() {
		return None;
	}
	Some(worktree.parent()?.join(repo_name))
}

/// Reads a linked worktree's `.git` file (`gitdir: <repo>/.git/worktrees/<name>`)
/// and returns `<repo>`.
pub fn repo_root_from_worktree(worktree: &Path) -> ControlResult<PathBuf> {
	let dot_git = worktree.join(".git");
	let content = fs::read_to_string(&dot_git).map_err(|e| {
		ControlError::Repository(format!("cannot read {}: {e}", dot_git.display()))
	})?;
	let gitdir = content
		.lines()
		.find_map(|l| l.trim().strip_prefix("gitdir:"))
		.map(str::trim)
		.ok_or_else(|| {
			ControlError::Repository(format!("no gitdir line in {}", dot_git.display()))
		})?;

	let gitdir = PathBuf::from(gitdir);
	let gitdir = if gitdir.is_absolute() {
		gitdir
	} else {
		worktree.join(gitdir)
	};
	// <repo>/.git/worktrees/<name> -> <repo>
	gitdir
		.ancestors()
		.find(|p| p.file_name().map(|n| n == ".git").unwrap_or(false))
		.and_then(Path::parent)
		.map(Path::to_path_buf)
		.ok_or_else(|| {
			ControlError::Repository(format!(
				"unexpected gitdir layout in {}",
				dot_git.display()
			))
		})
}

pub fn parse_worktree_porcelain(output: &str) -> Vec<Worktree> {
	let mut worktrees = Vec::new();
	let mut current: Option<Worktree> = None;
	for line in output.lines() {
		if let Some(path) = line.strip_prefix("worktree ") {
			if let Some(wt) = current.take() {
				worktrees.push(wt);
			}
			current = Some(Worktree {
				path: PathBuf::from(path),
				branch: None,
				// git always lists the main working tree first.
				is_main: worktrees.is_empty(),
			});
		} else if let Some(branch) = line.strip_prefix("branch ") {
			if let Some(wt) = current.as_mut() {
				wt.branch = Some(branch.trim_start_matches("refs/heads/").to_string());
			}
		}
	}
	if let Some(wt) = current {
		worktrees.push(wt);
	}
	worktrees
}

fn non_empty_lines(text: &str) -> Vec<String> {
	text.lines()
		.map(str::trim)
		.filter(|l| !l.is_empty())
		.map(str::to_string)
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_worktree_path_for() {
		let path = worktree_path_for(Path::new("/src/app"), "parallel/fix-login");
		assert_eq!(path, PathBuf::from("/src/app-wt-parallel-fix-login"));
	}

	#[test]
	fn test_repo_from_worktree_name() {
		let wt = worktree_path_for(Path::new("/src/my-app"), "parallel/fix");
		assert_eq!(
			repo_from_worktree_name(&wt, "parallel/fix"),
			Some(PathBuf::from("/src/my-app"))
		);
		assert_eq!(repo_from_worktree_name(&wt, "parallel/other"), None);
	}

	#[test]
	fn test_parse_worktree_porcelain() {
		let output = "worktree /src/app\nHEAD abc\nbranch refs/heads/main\n\nworktree /src/app-wt-parallel-a\nHEAD def\nbranch refs/heads/parallel/a\n\nworktree /src/detached\nHEAD 123\ndetached\n";
		let wts = parse_worktree_porcelain(output);
		assert_eq!(wts.len(), 3);
		assert!(wts[0].is_main);
		assert_eq!(wts[0].branch.as_deref(), Some("main"));
		assert!(!wts[1].is_main);
		assert_eq!(wts[1].branch.as_deref(), Some("parallel/a"));
		assert!(wts[2].branch.is_none());
	}

	#[test]
	fn test_repo_root_from_worktree_file() {
		let temp = TempDir::new().unwrap();
		let wt = temp.path().join("app-wt-parallel-a");
		fs::create_dir_all(&wt).unwrap();
		fs::write(
			wt.join(".git"),
			"gitdir: /src/app/.git/worktrees/app-wt-parallel-a\n",
		)
		.unwrap();
		assert_eq!(repo_root_from_worktree(&wt).unwrap(), PathBuf::from("/src/app"));
	}

	#[test]
	fn test_repo_root_requires_git_file() {
		let temp = TempDir::new().unwrap();
		assert!(matches!(
			repo_root_from_worktree(temp.path()),
			Err(ControlError::Repository(_))
		));
	}

	async fn sh(dir: &Path, script: &str) {
		let out = process::run("sh", ["-c", script], Some(dir), Duration::from_secs(30))
			.await
			.unwrap();
		assert!(out.success, "{script}: {}", out.stderr);
	}

	async fn init_repo(root: &Path) -> PathBuf {
		let repo = root.join("app");
		fs::create_dir_all(&repo).unwrap();
		sh(
			&repo,
			"git init -q -b main && git config user.email t@example.com && git config user.name tester \
			 && echo base > shared.txt && git add . && git commit -q -m init",
		)
		.await;
		repo
	}

	#[tokio::test]
	async fn test_worktree_lifecycle_and_merge() {
		let temp = TempDir::new().unwrap();
		let repo = init_repo(temp.path()).await;
		let git = Git::new(Duration::from_secs(30));

		assert_eq!(git.base_branch(&repo).await.unwrap(), "main");
		let a = git.create_worktree(&repo, "parallel/a", "main").await.unwrap();
		let b = git.create_worktree(&repo, "parallel/b", "main").await.unwrap();
		assert_eq!(repo_root_from_worktree(&a).unwrap().canonicalize().unwrap(), repo.canonicalize().unwrap());

		sh(&a, "echo a > a.txt && git add . && git commit -q -m 'add a'").await;
		sh(&b, "echo b > b.txt && git add . && git commit -q -m 'add b'").await;

		let commits = git.commits_between(&repo, "main", "parallel/a").await.unwrap();
		assert_eq!(commits.len(), 1);
		assert_eq!(commits[0].subject, "add a");

		let listed = git.list_worktrees(&repo).await.unwrap();
		assert_eq!(listed.len(), 3);

		let outcome = git
			.merge_branches(
				&repo,
				"main",
				&["parallel/a".to_string(), "parallel/b".to_string()],
				"merge group",
			)
			.await
			.unwrap();
		assert!(matches!(outcome, MergeOutcome::Merged { .. }));
		assert!(repo.join("a.txt").exists() && repo.join("b.txt").exists());

		git.remove_worktree(&repo, &a).await.unwrap();
		git.delete_branch(&repo, "parallel/a").await.unwrap();
		assert!(!a.exists());
		assert!(!git.branch_exists(&repo, "parallel/a").await);
	}

	#[tokio::test]
	async fn test_conflicting_merge_is_rolled_back() {
		let temp = TempDir::new().unwrap();
		let repo = init_repo(temp.path()).await;
		let git = Git::new(Duration::from_secs(30));

		let a = git.create_worktree(&repo, "parallel/a", "main").await.unwrap();
		let b = git.create_worktree(&repo, "parallel/b", "main").await.unwrap();
		sh(&a, "echo from-a > shared.txt && git commit -q -am 'a edits shared'").await;
		sh(&b, "echo from-b > shared.txt && git commit -q -am 'b edits shared'").await;

		let outcome = git
			.merge_branches(
				&repo,
				"main",
				&["parallel/a".to_string(), "parallel/b".to_string()],
				"merge group",
			)
			.await
			.unwrap();
		match outcome {
			MergeOutcome::Conflict { files } => assert_eq!(files, vec!["shared.txt".to_string()]),
			other => panic!("expected conflict, got {other:?}"),
		}
		assert_eq!(fs::read_to_string(repo.join("shared.txt")).unwrap().trim(), "base");
	}
}
