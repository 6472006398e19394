//! Request/response surface for remote clients. Every request carries a
//! correlation id that is echoed back; every outcome is reported as
//! `{ success, payload?, error?, code? }` and nothing propagates past here.

use crate::error::{ControlError, ControlResult};
use crate::git::Vcs;
use crate::injector::{retry_once, InputInjector};
use crate::model::{session_id_for_path, StatusEvent, WorkerSpec};
use crate::orchestrator::{Orchestrator, OrchestratorEvent};
use crate::session::SessionContext;
use crate::tmux::Multiplexer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const DEFAULT_CAPTURE_LINES: usize = 100;

fn default_capture_lines() -> usize {
	DEFAULT_CAPTURE_LINES
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
	ListTmuxSessions,
	#[serde(rename_all = "camelCase")]
	CreateTmuxSession {
		working_dir: PathBuf,
		#[serde(default)]
		name: Option<String>,
		#[serde(default)]
		start_agent: bool,
	},
	#[serde(rename_all = "camelCase")]
	KillTmuxSession { session_name: String },
	#[serde(rename_all = "camelCase")]
	SwitchTmuxSession { session_name: String },
	#[serde(rename_all = "camelCase")]
	ListWorktrees { repo_path: PathBuf },
	#[serde(rename_all = "camelCase")]
	SwitchSession {
		session_id: String,
		#[serde(default)]
		epoch: Option<u64>,
	},
	#[serde(rename_all = "camelCase")]
	SendInput {
		input: String,
		#[serde(default)]
		session_name: Option<String>,
	},
	#[serde(rename_all = "camelCase")]
	SendChoice {
		selected_indices: Vec<usize>,
		option_count: usize,
		#[serde(default)]
		multi_select: bool,
		#[serde(default)]
		other_text: Option<String>,
		#[serde(default)]
		session_name: Option<String>,
	},
	#[serde(rename_all = "camelCase")]
	CancelInput {
		#[serde(default)]
		session_name: Option<String>,
	},
	#[serde(rename_all = "camelCase")]
	CapturePane {
		#[serde(default)]
		session_name: Option<String>,
		#[serde(default = "default_capture_lines")]
		lines: usize,
		#[serde(default)]
		offset: usize,
	},
	#[serde(rename_all = "camelCase")]
	CreateWorkGroup {
		name: String,
		foreman_session_id: String,
		repo_path: PathBuf,
		workers: Vec<WorkerSpec>,
	},
	ListWorkGroups,
	#[serde(rename_all = "camelCase")]
	CancelWorkGroup { group_id: String },
	#[serde(rename_all = "camelCase")]
	MergeWorkGroup { group_id: String },
	#[serde(rename_all = "camelCase")]
	RetryWorker { group_id: String, worker_id: String },
	#[serde(rename_all = "camelCase")]
	DismissWorkGroup { group_id: String },
}

impl Request {
	/// Requests that move the session pointer. The transport must finish these
	/// before reading the next request so dependent requests see the new pointer.
	pub fn is_switch(&self) -> bool {
		matches!(
			self,
			Request::SwitchSession { .. } | Request::SwitchTmuxSession { .. }
		)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
	#[serde(rename = "requestId", default)]
	pub request_id: Option<String>,
	#[serde(flatten)]
	pub request: Request,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub request_id: Option<String>,
	pub success: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub payload: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
}

impl Response {
	pub fn ok(request_id: Option<String>, payload: Value) -> Self {
		Self {
			request_id,
			success: true,
			payload: Some(payload),
			error: None,
			code: None,
		}
	}

	pub fn failure(request_id: Option<String>, err: &ControlError) -> Self {
		let payload = match err {
			ControlError::MergeConflict { files } => Some(json!({ "files": files })),
			_ => None,
		};
		Self {
			request_id,
			success: false,
			payload,
			error: Some(err.to_string()),
			code: Some(err.code().to_string()),
		}
	}

	pub fn malformed(request_id: Option<String>, message: impl Into<String>) -> Self {
		Self {
			request_id,
			success: false,
			payload: None,
			error: Some(message.into()),
			code: Some("bad_request".to_string()),
		}
	}
}

/// Everything the daemon writes to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
	Response(Response),
	StatusUpdate(StatusEvent),
	WorkGroupEvent { event: OrchestratorEvent },
}

/// Parses one request line. On failure the error response still echoes the
/// request id when one can be found.
pub fn parse_request(line: &str) -> Result<Envelope, Response> {
	serde_json::from_str::<Envelope>(line).map_err(|e| {
		let request_id = serde_json::from_str::<Value>(line)
			.ok()
			.and_then(|v| v.get("requestId").and_then(Value::as_str).map(str::to_string));
		Response::malformed(request_id, format!("invalid request: {e}"))
	})
}

pub struct Gateway {
	mux: Arc<dyn Multiplexer>,
	vcs: Arc<dyn Vcs>,
	injector: Arc<InputInjector>,
	orchestrator: Arc<Orchestrator>,
}

impl Gateway {
	pub fn new(
		mux: Arc<dyn Multiplexer>,
		vcs: Arc<dyn Vcs>,
		injector: Arc<InputInjector>,
		orchestrator: Arc<Orchestrator>,
	) -> Self {
		Self {
			mux,
			vcs,
			injector,
			orchestrator,
		}
	}

	pub fn orchestrator(&self) -> &Arc<Orchestrator> {
		&self.orchestrator
	}

	pub async fn handle(&self, ctx: &Mutex<SessionContext>, envelope: Envelope) -> Response {
		let Envelope {
			request_id,
			request,
		} = envelope;
		debug!(request_id = ?request_id, ?request, "handling request");
		match self.dispatch(ctx, request).await {
			Ok(payload) => Response::ok(request_id, payload),
			Err(e) => {
				warn!(request_id = ?request_id, code = e.code(), error = %e, "request failed");
				Response::failure(request_id, &e)
			}
		}
	}

	async fn dispatch(&self, ctx: &Mutex<SessionContext>, request: Request) -> ControlResult<Value> {
		match request {
			Request::ListTmuxSessions => {
				let sessions = self.mux.list_sessions().await?;
				Ok(json!({ "sessions": sessions }))
			}
			Request::CreateTmuxSession {
				working_dir,
				name,
				start_agent,
			} => {
				let name = name.unwrap_or_else(|| default_session_name(&working_dir));
				let session_name = self
					.mux
					.create_session(&name, &working_dir, start_agent)
					.await?;
				Ok(json!({
					"sessionName": session_name,
					"sessionId": session_id_for_path(&working_dir),
				}))
			}
			Request::KillTmuxSession { session_name } => {
				self.mux.kill_session(&session_name).await?;
				let mut ctx = lock(ctx);
				if ctx.target() == Some(session_name.as_str()) {
					ctx.set_target(None);
				}
				Ok(json!({ "sessionName": session_name }))
			}
			Request::SwitchTmuxSession { session_name } => {
				let session = self
					.mux
					.list_sessions()
					.await?
					.into_iter()
					.find(|s| s.name == session_name)
					.ok_or_else(|| ControlError::SessionNotFound(session_name.clone()))?;
				let session_id = session
					.working_dir
					.as_deref()
					.map(|dir| session_id_for_path(Path::new(dir)));
				let epoch = {
					let mut ctx = lock(ctx);
					ctx.set_target(Some(session_name.clone()));
					match &session_id {
						Some(id) => ctx.begin_switch(id.clone()),
						None => ctx.epoch(),
					}
				};
				Ok(json!({
					"sessionName": session_name,
					"sessionId": session_id,
					"epoch": epoch,
				}))
			}
			Request::ListWorktrees { repo_path } => {
				let worktrees = self.vcs.list_worktrees(&repo_path).await?;
				Ok(json!({ "worktrees": worktrees }))
			}
			Request::SwitchSession { session_id, epoch } => {
				// The tmux session rooted where this session id points, if any.
				let session_name = match self.mux.list_sessions().await {
					Ok(sessions) => sessions
						.into_iter()
						.find(|s| {
							s.working_dir
								.as_deref()
								.is_some_and(|dir| session_id_for_path(Path::new(dir)) == session_id)
						})
						.map(|s| s.name),
					Err(e) => {
						debug!(error = %e, "cannot list sessions while switching");
						None
					}
				};
				let mut ctx = lock(ctx);
				match ctx.apply_switch(session_id.clone(), epoch) {
					Ok(epoch) => {
						ctx.set_target(session_name.clone());
						Ok(json!({
							"sessionId": session_id,
							"sessionName": session_name,
							"epoch": epoch,
						}))
					}
					Err(rejection) => Err(ControlError::InvalidState(format!(
						"switch to {session_id} rejected: {rejection:?}"
					))),
				}
			}
			Request::SendInput {
				input,
				session_name,
			} => {
				let target = resolve_target(ctx, session_name);
				self.injector.send_input(&input, target.as_deref()).await?;
				Ok(json!({ "sent": true }))
			}
			Request::SendChoice {
				selected_indices,
				option_count,
				multi_select,
				other_text,
				session_name,
			} => {
				let target = resolve_target(ctx, session_name);
				// Approvals race the session coming up, so these get one retry.
				retry_once(self.injector.retry_backoff(), || {
					self.injector.send_choice(
						&selected_indices,
						option_count,
						multi_select,
						other_text.as_deref(),
						target.as_deref(),
					)
				})
				.await?;
				Ok(json!({ "sent": true }))
			}
			Request::CancelInput { session_name } => {
				let target = resolve_target(ctx, session_name);
				self.injector.cancel_input(target.as_deref()).await?;
				Ok(json!({ "cancelled": true }))
			}
			Request::CapturePane {
				session_name,
				lines,
				offset,
			} => {
				let target = resolve_target(ctx, session_name);
				let content = self
					.injector
					.capture_pane_content(lines, offset, target.as_deref())
					.await?;
				let (session_id, epoch) = {
					let ctx = lock(ctx);
					(ctx.current().map(str::to_string), ctx.epoch())
				};
				Ok(json!({
					"content": content,
					"sessionId": session_id,
					"epoch": epoch,
				}))
			}
			Request::CreateWorkGroup {
				name,
				foreman_session_id,
				repo_path,
				workers,
			} => {
				let group = self
					.orchestrator
					.create_group(&name, &foreman_session_id, &repo_path, workers)
					.await?;
				to_value(&group)
			}
			Request::ListWorkGroups => Ok(json!({ "groups": self.orchestrator.list_groups() })),
			Request::CancelWorkGroup { group_id } => {
				to_value(&self.orchestrator.cancel_group(&group_id).await?)
			}
			Request::MergeWorkGroup { group_id } => {
				to_value(&self.orchestrator.merge_group(&group_id).await?)
			}
			Request::RetryWorker {
				group_id,
				worker_id,
			} => to_value(&self.orchestrator.retry_worker(&group_id, &worker_id).await?),
			Request::DismissWorkGroup { group_id } => {
				self.orchestrator.dismiss_group(&group_id).await?;
				Ok(json!({ "dismissed": group_id }))
			}
		}
	}
}

fn lock(ctx: &Mutex<SessionContext>) -> std::sync::MutexGuard<'_, SessionContext> {
	ctx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An explicit session name wins over the client's selected tmux session.
fn resolve_target(ctx: &Mutex<SessionContext>, session_name: Option<String>) -> Option<String> {
	session_name.or_else(|| lock(ctx).target().map(str::to_string))
}

fn to_value<T: Serialize>(value: &T) -> ControlResult<Value> {
	serde_json::to_value(value).map_err(|e| ControlError::InvalidState(e.to_string()))
}

fn default_session_name(dir: &Path) -> String {
	dir.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_else(|| "agent".to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use crate::model::{GroupStatus, LastMessage};
	use crate::orchestrator::OrchestratorSettings;
	use crate::store::GroupStore;
	use crate::testing::{FakeMux, FakeVcs};
	use crate::git::MergeOutcome;
	use std::time::Duration;
	use tempfile::TempDir;

	struct Setup {
		temp: TempDir,
		mux: Arc<FakeMux>,
		vcs: Arc<FakeVcs>,
		gateway: Gateway,
		ctx: Mutex<SessionContext>,
	}

	fn setup() -> Setup {
		let temp = TempDir::new().unwrap();
		let cfg = Config::default();
		let mux = Arc::new(FakeMux::new());
		let vcs = Arc::new(FakeVcs::new());
		let injector = Arc::new(InputInjector::new(mux.clone(), cfg.timing.clone()));
		let orchestrator = Orchestrator::new(
			mux.clone(),
			vcs.clone(),
			injector.clone(),
			GroupStore::new(temp.path().join("groups.json")),
			OrchestratorSettings::from(&cfg),
		);
		Setup {
			gateway: Gateway::new(mux.clone(), vcs.clone(), injector, orchestrator),
			temp,
			mux,
			vcs,
			ctx: Mutex::new(SessionContext::new()),
		}
	}

	impl Setup {
		async fn call(&self, json: Value) -> Response {
			let envelope = parse_request(&json.to_string()).unwrap();
			self.gateway.handle(&self.ctx, envelope).await
		}
	}

	#[test]
	fn test_parse_request_shapes() {
		let env = parse_request(
			r#"{"type":"send_choice","requestId":"r1","selectedIndices":[0,2],"optionCount":3,"multiSelect":true}"#,
		)
		.unwrap();
		assert_eq!(env.request_id.as_deref(), Some("r1"));
		assert_eq!(
			env.request,
			Request::SendChoice {
				selected_indices: vec![0, 2],
				option_count: 3,
				multi_select: true,
				other_text: None,
				session_name: None,
			}
		);

		let env = parse_request(r#"{"type":"capture_pane"}"#).unwrap();
		assert!(env.request_id.is_none());
		assert_eq!(
			env.request,
			Request::CapturePane {
				session_name: None,
				lines: DEFAULT_CAPTURE_LINES,
				offset: 0
			}
		);
	}

	#[test]
	fn test_malformed_request_echoes_id() {
		let resp = parse_request(r#"{"type":"launch_rockets","requestId":"r9"}"#).unwrap_err();
		assert_eq!(resp.request_id.as_deref(), Some("r9"));
		assert!(!resp.success);
		assert_eq!(resp.code.as_deref(), Some("bad_request"));

		let resp = parse_request("not json").unwrap_err();
		assert!(resp.request_id.is_none());
	}

	#[test]
	fn test_outbound_serialization() {
		let line = serde_json::to_value(Outbound::Response(Response::ok(
			Some("r1".to_string()),
			json!({ "sent": true }),
		)))
		.unwrap();
		assert_eq!(line["type"], "response");
		assert_eq!(line["requestId"], "r1");
		assert_eq!(line["success"], true);
		assert!(line.get("error").is_none());

		let line = serde_json::to_value(Outbound::WorkGroupEvent {
			event: OrchestratorEvent::GroupReadyToMerge {
				group_id: "g1".to_string(),
				name: "refactor".to_string(),
			},
		})
		.unwrap();
		assert_eq!(line["type"], "work_group_event");
		assert_eq!(line["event"]["type"], "group-ready-to-merge");
		assert_eq!(line["event"]["groupId"], "g1");
	}

	#[tokio::test(start_paused = true)]
	async fn test_session_lifecycle_requests() {
		let s = setup();
		let dir = s.temp.path().join("my_app");
		std::fs::create_dir_all(&dir).unwrap();

		let resp = s
			.call(json!({ "type": "create_tmux_session", "requestId": "1", "workingDir": dir }))
			.await;
		assert!(resp.success, "{resp:?}");
		let payload = resp.payload.unwrap();
		assert_eq!(payload["sessionName"], "my_app");
		assert_eq!(payload["sessionId"], session_id_for_path(&dir));

		let resp = s.call(json!({ "type": "switch_tmux_session", "sessionName": "my_app" })).await;
		assert_eq!(resp.payload.unwrap()["epoch"], 1);

		let resp = s.call(json!({ "type": "send_input", "input": "hello" })).await;
		assert!(resp.success);
		assert_eq!(s.mux.pane("my_app"), "hello\n");

		let resp = s.call(json!({ "type": "capture_pane", "lines": 10 })).await;
		let payload = resp.payload.unwrap();
		assert_eq!(payload["content"], "hello");
		assert_eq!(payload["sessionId"], session_id_for_path(&dir));

		let resp = s.call(json!({ "type": "kill_tmux_session", "sessionName": "my_app" })).await;
		assert!(resp.success);
		let resp = s.call(json!({ "type": "send_input", "input": "again" })).await;
		assert_eq!(resp.code.as_deref(), Some("invalid_state"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_missing_session_reports_process_not_found() {
		let s = setup();
		let resp = s
			.call(json!({ "type": "send_input", "requestId": "7", "input": "x", "sessionName": "ghost" }))
			.await;
		assert_eq!(resp.request_id.as_deref(), Some("7"));
		assert!(!resp.success);
		assert_eq!(resp.code.as_deref(), Some("process_not_found"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_send_choice_retries_once_for_late_session() {
		let s = setup();
		let mux = s.mux.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(100)).await;
			mux.add_session("agent", "/src/app");
		});

		let resp = s
			.call(json!({
				"type": "send_choice",
				"selectedIndices": [1],
				"optionCount": 3,
				"sessionName": "agent"
			}))
			.await;
		assert!(resp.success, "{resp:?}");
		assert_eq!(s.mux.keys("agent"), vec!["Down", "Enter"]);
	}

	#[tokio::test]
	async fn test_switch_session_refuses_stale_epoch() {
		let s = setup();
		let resp = s.call(json!({ "type": "switch_session", "sessionId": "A", "epoch": 4 })).await;
		assert_eq!(resp.payload.unwrap()["epoch"], 4);

		let resp = s.call(json!({ "type": "switch_session", "sessionId": "B", "epoch": 3 })).await;
		assert!(!resp.success);
		assert_eq!(s.ctx.lock().unwrap().current(), Some("A"));

		let resp = s.call(json!({ "type": "switch_session", "sessionId": "B" })).await;
		assert_eq!(resp.payload.unwrap()["epoch"], 5);
	}

	#[tokio::test(start_paused = true)]
	async fn test_switch_session_moves_input_target() {
		let s = setup();
		s.mux.add_session("api", "/src/api");
		s.mux.add_session("web", "/src/web");

		let resp = s.call(json!({ "type": "switch_tmux_session", "sessionName": "web" })).await;
		assert!(resp.success);
		let resp = s
			.call(json!({ "type": "switch_session", "sessionId": session_id_for_path(Path::new("/src/api")) }))
			.await;
		assert_eq!(resp.payload.unwrap()["sessionName"], "api");
		s.call(json!({ "type": "send_input", "input": "hi" })).await;
		assert_eq!(s.mux.pane("api"), "hi\n");
		assert_eq!(s.mux.pane("web"), "");

		let resp = s.call(json!({ "type": "switch_session", "sessionId": "-nowhere" })).await;
		assert!(resp.payload.unwrap()["sessionName"].is_null());
		let resp = s.call(json!({ "type": "send_input", "input": "lost" })).await;
		assert_eq!(resp.code.as_deref(), Some("invalid_state"));
		assert_eq!(s.mux.pane("web"), "");
	}

	#[tokio::test]
	async fn test_list_worktrees_request() {
		let s = setup();
		let repo = s.temp.path().join("app");
		s.vcs.add_branch("parallel/api");
		let resp = s.call(json!({ "type": "list_worktrees", "repoPath": repo })).await;
		let worktrees = resp.payload.unwrap()["worktrees"].clone();
		assert_eq!(worktrees[0]["isMain"], true);
		assert_eq!(worktrees[1]["branch"], "parallel/api");
	}

	#[tokio::test(start_paused = true)]
	async fn test_work_group_requests_and_merge_conflict() {
		let s = setup();
		let repo = s.temp.path().join("app");
		std::fs::create_dir_all(&repo).unwrap();

		let resp = s
			.call(json!({
				"type": "create_work_group",
				"name": "split",
				"foremanSessionId": "foreman",
				"repoPath": repo,
				"workers": [
					{ "taskSlug": "api", "taskDescription": "Split the API", "fileScope": ["src/api"] },
					{ "taskSlug": "ui", "taskDescription": "Split the UI" }
				]
			}))
			.await;
		assert!(resp.success, "{resp:?}");
		let group_id = resp.payload.unwrap()["id"].as_str().unwrap().to_string();

		let orch = s.gateway.orchestrator();
		for worker in orch.get_group(&group_id).unwrap().workers {
			orch.handle_status_event(&StatusEvent {
				session_id: worker.session_id.clone(),
				is_waiting_for_input: true,
				last_message: Some(LastMessage {
					content: "[[TASK COMPLETE]] done".to_string(),
				}),
				current_activity: None,
			})
			.await;
		}

		s.vcs.queue_merge(MergeOutcome::Conflict {
			files: vec!["src/shared.rs".to_string()],
		});
		let resp = s.call(json!({ "type": "merge_work_group", "groupId": group_id })).await;
		assert!(!resp.success);
		assert_eq!(resp.code.as_deref(), Some("merge_conflict"));
		assert_eq!(resp.payload.unwrap()["files"], json!(["src/shared.rs"]));

		let resp = s.call(json!({ "type": "merge_work_group", "groupId": group_id })).await;
		assert_eq!(resp.payload.unwrap()["commit"], "abc123");

		let resp = s.call(json!({ "type": "list_work_groups" })).await;
		let groups = resp.payload.unwrap()["groups"].clone();
		assert_eq!(groups[0]["status"], "completed");
		assert_eq!(orch.get_group(&group_id).unwrap().status, GroupStatus::Completed);

		let resp = s.call(json!({ "type": "dismiss_work_group", "groupId": group_id })).await;
		assert!(resp.success);
		let resp = s.call(json!({ "type": "cancel_work_group", "groupId": group_id })).await;
		assert_eq!(resp.code.as_deref(), Some("group_not_found"));
	}
}
