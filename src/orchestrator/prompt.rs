use crate::model::WorkerSpec;

/// The instruction typed into a freshly started worker. Kept on one line:
/// a newline sent through the pane would submit the prompt early.
pub fn worker_prompt(spec: &WorkerSpec, branch: &str, sentinel: &str) -> String {
	let mut parts = vec![
		"You are one of several agents working in parallel, each in its own git worktree of the same repository.".to_string(),
		format!("Your task: {}", flatten(&spec.task_description)),
	];

	if spec.file_scope.is_empty() {
		parts.push(
			"Stay within what this task needs; other agents are editing other parts of the repository."
				.to_string(),
		);
	} else {
		parts.push(format!(
			"Only modify files within: {}.",
			spec.file_scope.join(", ")
		));
	}

	parts.push(format!(
		"Commit your work to the current branch ({branch}) with clear messages. Do not merge, rebase or push."
	));
	parts.push(format!(
		"When you are completely done, start a new line with the completion marker followed by a one-line summary of what you changed. {}",
		describe_marker(sentinel)
	));
	parts.join(" ")
}

/// Spells the marker in two pieces. The pane echoes the prompt, and a literal
/// marker in that echo would read as the agent finishing.
fn describe_marker(sentinel: &str) -> String {
	let mut chars = sentinel.chars();
	match chars.next() {
		Some(first) => format!(
			"The completion marker is `{first}` immediately followed by `{}`, written together.",
			chars.as_str()
		),
		None => String::new(),
	}
}

fn flatten(text: &str) -> String {
	text.split_whitespace().collect::<Vec<_>>().join(" ")
}
