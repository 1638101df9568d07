//! Entry point: mounts the device filesystem and runs the WebSocket session
//! against the device's JSON-RPC endpoint.
//!
//! Two task contexts cooperate:
//! - the network task (below) owns the WebSocket: it dispatches inbound
//!   frames, drains the request queue once per tick, and periodically
//!   sweeps timed-out requests;
//! - filesystem handlers run on the FUSE driver's threads and only read
//!   the cache or queue requests — they never touch the socket.
//!
//! On reconnect the cache keeps its last-known contents; a fresh refresh
//! burst brings it back in line with the device.

mod crontab;
mod fs;
mod queue;
mod rpc;
mod session;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::queue::RequestQueue;
use crate::session::Session;
use crate::state::now_unix;

/// Seconds between ticks of the network loop.
const TICK_SECS: u64 = 1;

/// Timed-out requests are swept every this many ticks.
const SWEEP_EVERY_TICKS: u32 = 10;

/// Delay before a reconnect attempt.
const RECONNECT_DELAY_SECS: u64 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "shusefs",
    version,
    about = "Mount a Gen2+ Shelly device as a filesystem"
)]
struct Args {
    /// WebSocket URL of the device RPC endpoint, e.g. ws://192.168.1.100/rpc
    url: String,

    /// Directory to mount the device at.
    mountpoint: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Structured logging ──────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    if !args.url.starts_with("ws://") && !args.url.starts_with("wss://") {
        bail!("device URL must start with ws:// or wss://");
    }

    // ── Session wiring ──────────────────────────────────────────────
    let state = state::shared();
    let queue = Arc::new(RequestQueue::new());
    let session = Session::new(state, queue);

    // Mount first so the tree appears while the initial refresh is still
    // in flight; files for not-yet-known instances stay hidden.
    let mount = fs::spawn_mount(session.clone(), &args.mountpoint)
        .with_context(|| format!("failed to mount at {}", args.mountpoint.display()))?;
    info!(mountpoint = %args.mountpoint.display(), "filesystem mounted");

    // ── Signal handling ─────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("cannot install SIGTERM handler: {e}");
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
            cancel.cancel();
        });
    }

    // ── Network task ────────────────────────────────────────────────
    let result = run_session(&args.url, &session, &cancel).await;

    info!("unmounting filesystem");
    drop(mount);

    result
}

/// Connect loop. The cache survives reconnects; each successful connect
/// queues a refresh burst. Requests still QUEUED when the session ends are
/// dropped.
async fn run_session(url: &str, session: &Session, cancel: &CancellationToken) -> Result<()> {
    let mut ever_connected = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match tokio_tungstenite::connect_async(url).await {
            Ok((ws, _)) => {
                info!(url, "connected to device");
                ever_connected = true;
                if let Err(e) = session.refresh_all() {
                    warn!(error = %e, "could not queue full refresh");
                }
                drive_connection(ws, session, cancel).await;
                if cancel.is_cancelled() {
                    break;
                }
                warn!("connection lost; reconnecting");
            }
            Err(e) => {
                if !ever_connected {
                    // Never reached the device at all: report, don't spin.
                    return Err(e).context("failed to connect to device");
                }
                warn!(error = %e, "reconnect failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
        }
    }

    info!("session closed");
    Ok(())
}

/// One established connection: dispatch inbound frames, drain the queue per
/// tick, sweep timeouts every [`SWEEP_EVERY_TICKS`] ticks.
async fn drive_connection(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    session: &Session,
    cancel: &CancellationToken,
) {
    let (mut sink, mut stream) = ws.split();
    let mut ticker = interval(Duration::from_secs(TICK_SECS));
    let mut ticks: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => session.handle_frame(&text),
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {} // binary/pong frames are not part of the protocol
                Some(Err(e)) => {
                    warn!(error = %e, "websocket error");
                    return;
                }
            },

            _ = ticker.tick() => {
                // Drain QUEUED requests in id order. A send failure breaks
                // the drain; the request stays QUEUED for the next tick.
                while let Some((id, payload)) = session.queue().next_to_send() {
                    match sink.send(Message::Text(payload)).await {
                        Ok(()) => {
                            if let Err(e) = session.queue().mark_sent(id, now_unix()) {
                                warn!(req_id = id, error = %e, "could not mark request sent");
                            }
                        }
                        Err(e) => {
                            warn!(req_id = id, error = %e, "send failed; backing off");
                            break;
                        }
                    }
                }

                ticks += 1;
                if ticks >= SWEEP_EVERY_TICKS {
                    ticks = 0;
                    session.queue().sweep(now_unix());
                }
            }
        }
    }
}
