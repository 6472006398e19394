use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG: &str = r#"
[general]
agent_command = "claude"
state_file = "~/.companion/workgroups.json"
listen_addr = "127.0.0.1:9877"
branch_prefix = "parallel/"

[timing]
command_timeout_ms = 5000
session_settle_ms = 500
text_settle_ms = 100
enter_settle_ms = 50
key_interval_ms = 50
kill_step_ms = 500
retry_backoff_ms = 500
ready_timeout_ms = 15000
ready_poll_ms = 500
monitor_interval_ms = 5000
poll_interval_ms = 1000
idle_threshold_ms = 8000

[detection]
completion_sentinel = "[[TASK COMPLETE]]"
ready_markers = ["? for shortcuts", "Try \""]
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	pub general: General,
	#[serde(default)]
	pub timing: Timing,
	#[serde(default)]
	pub detection: Detection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct General {
	pub agent_command: String,
	pub state_file: String,
	#[serde(default = "default_listen_addr")]
	pub listen_addr: String,
	#[serde(default = "default_branch_prefix")]
	pub branch_prefix: String,
}

fn default_listen_addr() -> String {
	"127.0.0.1:9877".to_string()
}

fn default_branch_prefix() -> String {
	"parallel/".to_string()
}

/// Delays and timeouts, all in milliseconds on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
	pub command_timeout_ms: u64,
	pub session_settle_ms: u64,
	pub text_settle_ms: u64,
	pub enter_settle_ms: u64,
	pub key_interval_ms: u64,
	pub kill_step_ms: u64,
	pub retry_backoff_ms: u64,
	pub ready_timeout_ms: u64,
	pub ready_poll_ms: u64,
	pub monitor_interval_ms: u64,
	pub poll_interval_ms: u64,
	pub idle_threshold_ms: u64,
}

impl Default for Timing {
	fn default() -> Self {
		Self {
			command_timeout_ms: 5000,
			session_settle_ms: 500,
			text_settle_ms: 100,
			enter_settle_ms: 50,
			key_interval_ms: 50,
			kill_step_ms: 500,
			retry_backoff_ms: 500,
			ready_timeout_ms: 15_000,
			ready_poll_ms: 500,
			monitor_interval_ms: 5000,
			poll_interval_ms: 1000,
			idle_threshold_ms: 8000,
		}
	}
}

impl Timing {
	pub fn command_timeout(&self) -> Duration {
		Duration::from_millis(self.command_timeout_ms)
	}

	pub fn session_settle(&self) -> Duration {
		Duration::from_millis(self.session_settle_ms)
	}

	pub fn text_settle(&self) -> Duration {
		Duration::from_millis(self.text_settle_ms)
	}

	pub fn enter_settle(&self) -> Duration {
		Duration::from_millis(self.enter_settle_ms)
	}

	pub fn key_interval(&self) -> Duration {
		Duration::from_millis(self.key_interval_ms)
	}

	pub fn kill_step(&self) -> Duration {
		Duration::from_millis(self.kill_step_ms)
	}

	pub fn retry_backoff(&self) -> Duration {
		Duration::from_millis(self.retry_backoff_ms)
	}

	pub fn ready_timeout(&self) -> Duration {
		Duration::from_millis(self.ready_timeout_ms)
	}

	pub fn ready_poll(&self) -> Duration {
		Duration::from_millis(self.ready_poll_ms)
	}

	pub fn monitor_interval(&self) -> Duration {
		Duration::from_millis(self.monitor_interval_ms)
	}

	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	pub fn idle_threshold(&self) -> Duration {
		Duration::from_millis(self.idle_threshold_ms)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Detection {
	/// Workers are told to start their final message with this marker.
	pub completion_sentinel: String,
	/// Any of these in the pane means the agent CLI has finished booting.
	pub ready_markers: Vec<String>,
}

impl Default for Detection {
	fn default() -> Self {
		Self {
			completion_sentinel: "[[TASK COMPLETE]]".to_string(),
			ready_markers: vec!["? for shortcuts".to_string(), "Try \"".to_string()],
		}
	}
}

impl Default for Config {
	fn default() -> Self {
		let mut cfg: Config =
			toml::from_str(DEFAULT_CONFIG).expect("embedded default config is valid TOML");
		cfg.general.state_file = expand_path(&cfg.general.state_file);
		cfg
	}
}

pub fn load_or_init() -> Result<Config> {
	let base_dir = base_dir()?;
	if !base_dir.exists() {
		fs::create_dir_all(&base_dir)
			.with_context(|| format!("failed to create {}", base_dir.display()))?;
	}

	let config_path = base_dir.join("config.toml");
	if !config_path.exists() {
		fs::write(&config_path, DEFAULT_CONFIG.trim_start())?;
	}
	load_from(&config_path)
}

pub fn load_from(path: &Path) -> Result<Config> {
	let content = fs::read_to_string(path)
		.with_context(|| format!("failed to read config {}", path.display()))?;
	let mut cfg: Config = toml::from_str(&content)
		.with_context(|| format!("failed to parse config {}", path.display()))?;
	cfg.general.state_file = expand_path(&cfg.general.state_file);
	if let Some(parent) = Path::new(&cfg.general.state_file).parent() {
		let _ = fs::create_dir_all(parent);
	}
	Ok(cfg)
}

pub fn expand_path(input: &str) -> String {
	if input.starts_with("~/") {
		if let Some(home) = dirs::home_dir() {
			return home
				.join(input.trim_start_matches("~/"))
				.to_string_lossy()
				.into_owned();
		}
	}
	input.to_string()
}

pub fn base_dir() -> Result<PathBuf> {
	dirs::home_dir()
		.map(|p| p.join(".companion"))
		.ok_or_else(|| anyhow::anyhow!("Failed to resolve home directory"))
}
