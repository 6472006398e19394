//! Text heuristics over agent output. Everything that pattern-matches terminal
//! text lives here so the orchestrator's state machine never looks at raw panes.

use crate::model::WorkerQuestion;
use once_cell::sync::Lazy;
use regex::Regex;

static NEEDS_INPUT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
	vec![
		// Permission prompts (high confidence)
		Regex::new(r"\[Y/n\]").unwrap(),
		Regex::new(r"\[y/N\]").unwrap(),
		Regex::new(r"\(y/N\)").unwrap(),
		Regex::new(r"\(Y/n\)").unwrap(),
		// Question patterns (high confidence)
		Regex::new(r"Do you want to proceed").unwrap(),
		Regex::new(r"Should I proceed").unwrap(),
		Regex::new(r"Would you like me to").unwrap(),
		Regex::new(r"Press enter to continue").unwrap(),
		Regex::new(r"waiting for.*input").unwrap(),
		// fzf-style prompt
		Regex::new(r"^\? ").unwrap(),
		// Multi-select picker
		Regex::new(r"Enter to select.*Tab/Arrow").unwrap(),
		// Free-text answer prompt
		Regex::new(r"Type your answer").unwrap(),
	]
});

static OPTION_LINE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^\s*(?:[❯>]\s*)?(?:\d+[.)]|[-*•])\s+(.+)$").unwrap());

/// Lines that render the agent's input box or status footer rather than output.
static CHROME_LINE: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"^\s*(?:[─━-]{3,}|[╭╰│].*|>\s*$|\? for shortcuts.*|esc to interrupt.*)\s*$").unwrap()
});

pub fn needs_input(lines: &[&str]) -> bool {
	lines
		.iter()
		.any(|l| NEEDS_INPUT_PATTERNS.iter().any(|re| re.is_match(l)))
}

/// The agent's spinner footer; present while a turn is still running.
static BUSY_LINE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?i)(?:esc|ctrl\+c) to interrupt").unwrap());

pub fn is_busy(pane: &str) -> bool {
	BUSY_LINE.is_match(pane)
}

pub fn is_ready(pane: &str, markers: &[String]) -> bool {
	markers.iter().any(|m| !m.is_empty() && pane.contains(m.as_str()))
}

pub fn is_completion(content: &str, sentinel: &str) -> bool {
	!sentinel.is_empty() && content.trim_start().starts_with(sentinel)
}

/// Best-effort question: first non-empty line is the prompt, numbered or
/// bulleted lines after it are the options.
pub fn extract_question(content: &str) -> WorkerQuestion {
	let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
	let prompt = lines.next().unwrap_or_default().to_string();
	let options = lines
		.filter_map(|l| OPTION_LINE.captures(l))
		.filter_map(|c| c.get(1))
		.map(|m| m.as_str().trim().to_string())
		.collect();
	WorkerQuestion { prompt, options }
}

/// The message an agent most recently printed. When an agent line opens with
/// the completion sentinel, everything from the last such line onward; otherwise
/// the trailing block of output above the input box.
pub fn last_message(pane: &str, sentinel: &str) -> Option<String> {
	let lines: Vec<&str> = pane.lines().collect();

	if !sentinel.is_empty() {
		if let Some(start) = lines.iter().rposition(|l| opens_with_sentinel(l, sentinel)) {
			let rest = lines[start + 1..]
				.iter()
				.take_while(|l| !CHROME_LINE.is_match(l))
				.copied();
			let head = strip_bullet(lines[start]);
			let text: Vec<&str> = std::iter::once(head.as_str()).chain(rest).collect();
			return Some(text.join("\n").trim_end().to_string());
		}
	}

	let content: Vec<&str> = lines
		.iter()
		.copied()
		.filter(|l| !CHROME_LINE.is_match(l))
		.collect();
	let end = content.iter().rposition(|l| !l.trim().is_empty())?;
	let start = content[..end]
		.iter()
		.rposition(|l| l.trim().is_empty())
		.map(|i| i + 1)
		.unwrap_or(0);
	Some(strip_bullet(&content[start..=end].join("\n")))
}

/// Only agent output counts: echoed user input is drawn behind a prompt glyph
/// and never matches, nor does a sentinel quoted mid-sentence.
fn opens_with_sentinel(line: &str, sentinel: &str) -> bool {
	let trimmed = line.trim_start();
	if trimmed.starts_with(['>', '❯']) {
		return false;
	}
	strip_bullet(trimmed).starts_with(sentinel)
}

/// Agent CLIs prefix assistant turns with a marker glyph.
fn strip_bullet(text: &str) -> String {
	text.trim()
		.trim_start_matches(['⏺', '●', '•'])
		.trim_start()
		.to_string()
}
