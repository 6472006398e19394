//! Newline-delimited JSON over TCP. One reader loop and one writer task per
//! client; the writer is the only thing that touches the socket's write half.

use crate::gateway::{parse_request, Gateway, Outbound};
use crate::model::StatusEvent;
use crate::orchestrator::OrchestratorEvent;
use crate::session::SessionContext;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const CLIENT_QUEUE: usize = 128;

pub struct Server {
	gateway: Arc<Gateway>,
	status: broadcast::Sender<StatusEvent>,
}

impl Server {
	pub fn new(gateway: Arc<Gateway>, status: broadcast::Sender<StatusEvent>) -> Self {
		Self { gateway, status }
	}

	pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
		info!(addr = %listener.local_addr()?, "listening for clients");
		loop {
			let (stream, peer) = listener.accept().await?;
			let this = Arc::clone(&self);
			tokio::spawn(async move {
				if let Err(e) = this.handle_client(stream, peer).await {
					warn!(%peer, error = %e, "client connection error");
				}
			});
		}
	}

	async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
		info!(%peer, "client connected");
		let (reader, writer) = stream.into_split();
		let (tx, mut rx) = mpsc::channel::<Outbound>(CLIENT_QUEUE);

		let writer_task = tokio::spawn(async move {
			let mut writer = BufWriter::new(writer);
			while let Some(message) = rx.recv().await {
				let line = serde_json::to_string(&message)? + "\n";
				writer.write_all(line.as_bytes()).await?;
				writer.flush().await?;
			}
			Ok::<_, anyhow::Error>(())
		});

		let ctx = Arc::new(Mutex::new(SessionContext::new()));
		let forwarder = tokio::spawn(forward_events(
			self.status.subscribe(),
			self.gateway.orchestrator().subscribe(),
			Arc::clone(&ctx),
			tx.clone(),
		));

		let mut lines = BufReader::new(reader).lines();
		while let Some(line) = lines.next_line().await? {
			if line.trim().is_empty() {
				continue;
			}
			let envelope = match parse_request(&line) {
				Ok(envelope) => envelope,
				Err(response) => {
					let _ = tx.send(Outbound::Response(response)).await;
					continue;
				}
			};

			if envelope.request.is_switch() {
				// Finish the switch before reading anything that depends on it.
				let response = self.gateway.handle(&ctx, envelope).await;
				let _ = tx.send(Outbound::Response(response)).await;
				continue;
			}

			let gateway = Arc::clone(&self.gateway);
			let ctx = Arc::clone(&ctx);
			let tx = tx.clone();
			tokio::spawn(async move {
				let response = gateway.handle(&ctx, envelope).await;
				let _ = tx.send(Outbound::Response(response)).await;
			});
		}

		forwarder.abort();
		drop(tx);
		// In-flight requests hold their own senders; the writer drains them.
		if let Ok(Err(e)) = writer_task.await {
			debug!(%peer, error = %e, "writer stopped");
		}
		info!(%peer, "client disconnected");
		Ok(())
	}
}

/// Pushes status updates the client's session context accepts, and every
/// work-group event. Pushes never change the client's selection.
async fn forward_events(
	mut status: broadcast::Receiver<StatusEvent>,
	mut groups: broadcast::Receiver<OrchestratorEvent>,
	ctx: Arc<Mutex<SessionContext>>,
	tx: mpsc::Sender<Outbound>,
) {
	loop {
		let message = tokio::select! {
			received = status.recv() => match received {
				Ok(event) => {
					let accepted = ctx
						.lock()
						.map(|ctx| ctx.check(Some(&event.session_id), None).is_accepted())
						.unwrap_or(false);
					if !accepted {
						continue;
					}
					Outbound::StatusUpdate(event)
				}
				Err(broadcast::error::RecvError::Lagged(n)) => {
					warn!(skipped = n, "client fell behind on status updates");
					continue;
				}
				Err(broadcast::error::RecvError::Closed) => return,
			},
			received = groups.recv() => match received {
				Ok(event) => Outbound::WorkGroupEvent { event },
				Err(broadcast::error::RecvError::Lagged(n)) => {
					warn!(skipped = n, "client fell behind on work group events");
					continue;
				}
				Err(broadcast::error::RecvError::Closed) => return,
			},
		};
		if tx.send(message).await.is_err() {
			return;
		}
	}
}
