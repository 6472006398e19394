use crate::config::Timing;
use crate::error::{ControlError, ControlResult};
use crate::tmux::{Key, Multiplexer};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// One step of a key program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keystroke {
	Key(Key),
	Text(String),
}

/// Builds the keys that drive an interactive picker to the given selection.
///
/// - With `other_text`, the free-text row after the last option is chosen
///   and the text typed into it.
/// - Multi-select walks every row top to bottom, toggling selected rows with
///   Space, then confirms once.
/// - Single-select moves down to the first selected index and confirms.
pub fn choice_keys(
	selected: &[usize],
	option_count: usize,
	multi_select: bool,
	other_text: Option<&str>,
) -> Vec<Keystroke> {
	let mut keys = Vec::new();

	if let Some(text) = other_text {
		keys.extend((0..option_count).map(|_| Keystroke::Key(Key::Down)));
		keys.push(Keystroke::Key(Key::Enter));
		keys.push(Keystroke::Text(text.to_string()));
		keys.push(Keystroke::Key(Key::Enter));
		return keys;
	}

	if multi_select {
		for index in 0..option_count {
			if selected.contains(&index) {
				keys.push(Keystroke::Key(Key::Space));
			}
			if index + 1 < option_count {
				keys.push(Keystroke::Key(Key::Down));
			}
		}
		keys.push(Keystroke::Key(Key::Enter));
		return keys;
	}

	let index = selected.first().copied().unwrap_or(0);
	keys.extend((0..index).map(|_| Keystroke::Key(Key::Down)));
	keys.push(Keystroke::Key(Key::Enter));
	keys
}

/// The only component that types into panes. Every injection holds `lock` for
/// its whole key sequence, so two callers can never interleave keystrokes in
/// one target. The guard is released on every exit path, errors included.
pub struct InputInjector {
	mux: Arc<dyn Multiplexer>,
	timing: Timing,
	lock: Mutex<()>,
}

impl InputInjector {
	pub fn new(mux: Arc<dyn Multiplexer>, timing: Timing) -> Self {
		Self {
			mux,
			timing,
			lock: Mutex::new(()),
		}
	}

	async fn ensure_session(&self, target: &str) -> ControlResult<()> {
		if self.mux.has_session(target).await {
			Ok(())
		} else {
			Err(ControlError::SessionNotFound(target.to_string()))
		}
	}

	pub async fn send_input(&self, text: &str, target: Option<&str>) -> ControlResult<()> {
		let target = resolve(target)?;
		let _guard = self.lock.lock().await;
		self.ensure_session(target).await?;

		self.mux.send_literal(target, text).await?;
		// Enter must not overtake bulk text still being delivered to the pane.
		sleep(self.timing.text_settle()).await;
		self.mux.send_key(target, Key::Enter).await?;
		sleep(self.timing.enter_settle()).await;

		debug!(session = %target, chars = text.chars().count(), "sent input");
		Ok(())
	}

	pub async fn send_choice(
		&self,
		selected: &[usize],
		option_count: usize,
		multi_select: bool,
		other_text: Option<&str>,
		target: Option<&str>,
	) -> ControlResult<()> {
		let target = resolve(target)?;
		check_selection(selected, option_count, multi_select, other_text)?;
		let program = choice_keys(selected, option_count, multi_select, other_text);
		let _guard = self.lock.lock().await;
		self.ensure_session(target).await?;

		for stroke in &program {
			match stroke {
				Keystroke::Key(key) => self.mux.send_key(target, *key).await?,
				Keystroke::Text(text) => self.mux.send_literal(target, text).await?,
			}
			sleep(self.timing.key_interval()).await;
		}

		info!(session = %target, ?selected, option_count, multi_select, "sent choice");
		Ok(())
	}

	/// Interrupts the target without waiting for queued injections.
	pub async fn cancel_input(&self, target: Option<&str>) -> ControlResult<()> {
		let target = resolve(target)?;
		self.ensure_session(target).await?;
		self.mux.send_key(target, Key::Interrupt).await
	}

	/// Reads pane text without taking the injection lock.
	pub async fn capture_pane_content(
		&self,
		lines: usize,
		offset: usize,
		target: Option<&str>,
	) -> ControlResult<String> {
		let target = resolve(target)?;
		self.mux.capture_pane(target, lines, offset).await
	}

	pub fn retry_backoff(&self) -> Duration {
		self.timing.retry_backoff()
	}
}

fn resolve(target: Option<&str>) -> ControlResult<&str> {
	target.ok_or_else(|| ControlError::InvalidState("no target session selected".to_string()))
}

/// Rejects selections the picker cannot represent. Free text needs no index.
fn check_selection(
	selected: &[usize],
	option_count: usize,
	multi_select: bool,
	other_text: Option<&str>,
) -> ControlResult<()> {
	if other_text.is_some() {
		return Ok(());
	}
	if !multi_select && selected.is_empty() {
		return Err(ControlError::InvalidState("no option selected".to_string()));
	}
	if let Some(index) = selected.iter().find(|&&i| i >= option_count) {
		return Err(ControlError::InvalidState(format!(
			"option {index} is out of range for {option_count} options"
		)));
	}
	Ok(())
}

/// Runs `op`, and if the target session was missing, once more after `backoff`.
pub async fn retry_once<T, F, Fut>(backoff: Duration, mut op: F) -> ControlResult<T>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = ControlResult<T>>,
{
	match op().await {
		Err(ControlError::SessionNotFound(name)) => {
			warn!(session = %name, "target session missing, retrying once");
			sleep(backoff).await;
			op().await
		}
		other => other,
	}
}
