mod config;
mod detection;
mod error;
mod escalation;
mod gateway;
mod git;
mod injector;
mod logging;
mod model;
mod orchestrator;
mod process;
mod server;
mod session;
mod store;
#[cfg(test)]
mod testing;
mod tmux;
mod watcher;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use escalation::{run_escalation, DefaultPolicy, LogSink};
use gateway::Gateway;
use git::{Git, Vcs};
use injector::InputInjector;
use model::WorkGroup;
use orchestrator::{Orchestrator, OrchestratorSettings};
use server::Server;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use store::GroupStore;
use tmux::{Multiplexer, Tmux};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;
use watcher::PaneWatcher;

#[derive(Parser)]
#[command(name = "companiond")]
#[command(about = "Drives interactive CLI agents in tmux and runs parallel worktree workers")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the daemon (default)
	Serve {
		/// Address to listen on, overriding the config file
		#[arg(long)]
		listen: Option<String>,
	},
	/// Print JSON for every tmux session
	Sessions,
	/// Print the persisted work groups as JSON
	Groups,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	logging::init();
	let cfg = config::load_or_init().context("failed to load config")?;

	match cli.command.unwrap_or(Commands::Serve { listen: None }) {
		Commands::Serve { listen } => serve(cfg, listen).await,
		Commands::Sessions => {
			let tmux = Tmux::new(cfg.timing.clone(), cfg.general.agent_command.clone());
			let sessions = tmux.list_sessions().await?;
			println!("{}", serde_json::to_string_pretty(&sessions)?);
			Ok(())
		}
		Commands::Groups => {
			let groups = read_groups(Path::new(&cfg.general.state_file))?;
			println!("{}", serde_json::to_string_pretty(&groups)?);
			Ok(())
		}
	}
}

/// Read-only view of the state file; unlike the daemon's loader this never
/// sets an unreadable file aside.
fn read_groups(path: &Path) -> Result<Vec<WorkGroup>> {
	if !path.exists() {
		return Ok(Vec::new());
	}
	let json = fs::read_to_string(path)
		.with_context(|| format!("failed to read {}", path.display()))?;
	serde_json::from_str(&json).with_context(|| format!("failed to parse {}", path.display()))
}

async fn serve(cfg: Config, listen: Option<String>) -> Result<()> {
	let mux: Arc<dyn Multiplexer> = Arc::new(Tmux::new(
		cfg.timing.clone(),
		cfg.general.agent_command.clone(),
	));
	let vcs: Arc<dyn Vcs> = Arc::new(Git::new(cfg.timing.command_timeout()));
	let injector = Arc::new(InputInjector::new(mux.clone(), cfg.timing.clone()));
	let orchestrator = Orchestrator::new(
		mux.clone(),
		vcs.clone(),
		injector.clone(),
		GroupStore::new(&cfg.general.state_file),
		OrchestratorSettings::from(&cfg),
	);

	let (status_tx, _) = broadcast::channel(256);
	tokio::spawn(Arc::clone(&orchestrator).run_monitor());
	tokio::spawn(Arc::clone(&orchestrator).run_event_loop(status_tx.subscribe()));
	let watcher = PaneWatcher::new(
		mux.clone(),
		cfg.timing.clone(),
		cfg.detection.completion_sentinel.clone(),
		status_tx.clone(),
	);
	tokio::spawn(watcher.run());
	let escalations = orchestrator.subscribe();
	tokio::spawn(async move { run_escalation(escalations, &DefaultPolicy, &LogSink).await });

	let gateway = Arc::new(Gateway::new(mux, vcs, injector, orchestrator));
	let server = Arc::new(Server::new(gateway, status_tx));
	let addr = listen.unwrap_or_else(|| cfg.general.listen_addr.clone());
	let listener = TcpListener::bind(&addr)
		.await
		.with_context(|| format!("failed to bind {addr}"))?;

	tokio::select! {
		result = server.serve(listener) => result,
		_ = tokio::signal::ctrl_c() => {
			info!("shutting down");
			Ok(())
		}
	}
}
