//! Pane-polling status source for agents that have no transcript watcher.
//!
//! Each tick captures every tagged session, infers whether the agent is waiting
//! for input, and publishes a [`StatusEvent`] when that view changes.

use crate::config::Timing;
use crate::detection;
use crate::model::{session_id_for_path, LastMessage, StatusEvent};
use crate::tmux::Multiplexer;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace};

const CAPTURE_LINES: usize = 120;
const TAIL_LINES: usize = 15;
const ACTIVITY_CHARS: usize = 80;

struct Observed {
	pane: String,
	changed_at: Instant,
	last_event: Option<StatusEvent>,
}

pub struct PaneWatcher {
	mux: Arc<dyn Multiplexer>,
	timing: Timing,
	sentinel: String,
	events: broadcast::Sender<StatusEvent>,
	seen: HashMap<String, Observed>,
}

impl PaneWatcher {
	pub fn new(
		mux: Arc<dyn Multiplexer>,
		timing: Timing,
		sentinel: impl Into<String>,
		events: broadcast::Sender<StatusEvent>,
	) -> Self {
		Self {
			mux,
			timing,
			sentinel: sentinel.into(),
			events,
			seen: HashMap::new(),
		}
	}

	/// One pass over all tagged sessions. Returns what was published.
	pub async fn poll_once(&mut self) -> Vec<StatusEvent> {
		let sessions = match self.mux.list_sessions().await {
			Ok(sessions) => sessions,
			Err(e) => {
				debug!(error = %e, "cannot list sessions");
				return Vec::new();
			}
		};

		let now = Instant::now();
		let mut published = Vec::new();
		let mut live = Vec::with_capacity(sessions.len());
		for session in sessions.into_iter().filter(|s| s.tagged) {
			let Some(dir) = session.working_dir.as_deref() else {
				continue;
			};
			live.push(session.name.clone());
			let pane = match self.mux.capture_pane(&session.name, CAPTURE_LINES, 0).await {
				Ok(pane) => pane,
				Err(e) => {
					trace!(session = %session.name, error = %e, "capture failed");
					continue;
				}
			};

			let observed = self.seen.entry(session.name.clone()).or_insert_with(|| Observed {
				pane: String::new(),
				changed_at: now,
				last_event: None,
			});
			if observed.pane != pane {
				observed.pane = pane;
				observed.changed_at = now;
			}
			let idle = now.duration_since(observed.changed_at) >= self.timing.idle_threshold();
			let event = infer_status(
				&session_id_for_path(Path::new(dir)),
				&observed.pane,
				&self.sentinel,
				idle,
			);

			if observed.last_event.as_ref() != Some(&event) {
				observed.last_event = Some(event.clone());
				let _ = self.events.send(event.clone());
				published.push(event);
			}
		}
		self.seen.retain(|name, _| live.contains(name));
		published
	}

	pub async fn run(mut self) {
		let mut ticker = interval(self.timing.poll_interval());
		ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
		loop {
			ticker.tick().await;
			self.poll_once().await;
		}
	}
}

fn infer_status(session_id: &str, pane: &str, sentinel: &str, idle: bool) -> StatusEvent {
	let message = detection::last_message(pane, sentinel);
	let tail: Vec<&str> = {
		let lines: Vec<&str> = pane.lines().collect();
		let start = lines.len().saturating_sub(TAIL_LINES);
		lines[start..].to_vec()
	};
	let completed = message
		.as_deref()
		.map(|m| detection::is_completion(m, sentinel))
		.unwrap_or(false);
	let busy = detection::is_busy(pane);
	let waiting = completed || detection::needs_input(&tail) || (idle && !busy);

	let current_activity = if waiting {
		None
	} else {
		message
			.as_deref()
			.and_then(|m| m.lines().next())
			.map(|l| l.chars().take(ACTIVITY_CHARS).collect())
	};
	StatusEvent {
		session_id: session_id.to_string(),
		is_waiting_for_input: waiting,
		last_message: message.map(|content| LastMessage { content }),
		current_activity,
	}
}
