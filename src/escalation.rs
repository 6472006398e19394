//! Decides how loudly each orchestrator event should reach a human. Delivery
//! itself (push, desktop, chat) plugs in behind [`EscalationSink`].

use crate::orchestrator::OrchestratorEvent;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
	/// Needs a human now.
	Immediate,
	/// Worth mentioning, can be batched.
	Deferred,
	Silent,
}

pub trait EscalationPolicy: Send + Sync {
	fn classify(&self, event: &OrchestratorEvent) -> Tier;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPolicy;

impl EscalationPolicy for DefaultPolicy {
	fn classify(&self, event: &OrchestratorEvent) -> Tier {
		match event {
			OrchestratorEvent::WorkerError { .. } | OrchestratorEvent::GroupReadyToMerge { .. } => {
				Tier::Immediate
			}
			OrchestratorEvent::WorkerWaiting { .. } => Tier::Deferred,
			OrchestratorEvent::GroupMerged { .. } => Tier::Silent,
		}
	}
}

/// Pluggable delivery target for classified events.
#[async_trait]
pub trait EscalationSink: Send + Sync {
	fn sink_id(&self) -> &'static str;

	fn accepts(&self, tier: Tier) -> bool {
		tier != Tier::Silent
	}

	async fn deliver(&self, tier: Tier, event: &OrchestratorEvent);
}

/// Writes every escalation to the log; the default when nothing else is configured.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EscalationSink for LogSink {
	fn sink_id(&self) -> &'static str {
		"log"
	}

	fn accepts(&self, _tier: Tier) -> bool {
		true
	}

	async fn deliver(&self, tier: Tier, event: &OrchestratorEvent) {
		let summary = summarize(event);
		match tier {
			Tier::Immediate => warn!(?tier, "{summary}"),
			Tier::Deferred => info!(?tier, "{summary}"),
			Tier::Silent => debug!(?tier, "{summary}"),
		}
	}
}

pub fn summarize(event: &OrchestratorEvent) -> String {
	match event {
		OrchestratorEvent::WorkerWaiting {
			task_slug, question, ..
		} => match question {
			Some(q) if !q.prompt.is_empty() => format!("worker {task_slug} asks: {}", q.prompt),
			_ => format!("worker {task_slug} is waiting for input"),
		},
		OrchestratorEvent::WorkerError {
			task_slug, error, ..
		} => format!("worker {task_slug} failed: {error}"),
		OrchestratorEvent::GroupReadyToMerge { name, .. } => {
			format!("work group {name} is ready to merge")
		}
		OrchestratorEvent::GroupMerged { name, commit, .. } => {
			format!("work group {name} merged as {commit}")
		}
	}
}

/// Drains orchestrator events into `sink` until the channel closes.
pub async fn run_escalation(
	mut rx: broadcast::Receiver<OrchestratorEvent>,
	policy: &dyn EscalationPolicy,
	sink: &dyn EscalationSink,
) {
	loop {
		match rx.recv().await {
			Ok(event) => {
				let tier = policy.classify(&event);
				if sink.accepts(tier) {
					sink.deliver(tier, &event).await;
				}
			}
			Err(broadcast::error::RecvError::Lagged(n)) => {
				warn!(skipped = n, sink = sink.sink_id(), "escalation lagged behind");
			}
			Err(broadcast::error::RecvError::Closed) => return,
		}
	}
}
