//! Interactive shell sessions bridged to a client channel.
//!
//! A shell is opened on top of a host's live registry session. Output from
//! the remote PTY is pushed to the client as [`ShellEvent::Output`] chunks in
//! the order it arrives; input and resize requests go the other way through
//! the [`ShellCommand`] stream.
//!
//! # Architecture
//!
//! - `RunningShell`: the stored half of a session (metadata, input sender,
//!   cancellation token), kept in `storage::ShellStorage`.
//! - A forwarder task per session owns the output receiver and the client's
//!   event sender. It ends when the remote stream ends, when the client drops
//!   its [`ShellHandle`], or when the session is closed explicitly, and always
//!   removes the session from storage before emitting [`ShellEvent::Closed`].
//!
//! Sessions are independent: closing one never touches its siblings on the
//! same host.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fleet::clock::Clock;
use crate::fleet::error::FleetError;
use crate::fleet::registry::{PtySize, RemoteSessions, ShellChannel, ShellCommand};
use crate::fleet::storage::{DashMapShellStorage, ShellStorage};
use crate::fleet::types::ShellSessionInfo;

/// Capacity of the per-session event channel toward the client.
const EVENT_BUFFER: usize = 64;
/// How long a full event channel may hold back the final close event.
const CLOSE_EVENT_GRACE: Duration = Duration::from_secs(5);

/// Close reason when the remote end finishes the stream.
pub const REASON_STREAM_ENDED: &str = "Shell closed";
/// Close reason when the client stops listening.
pub const REASON_CLIENT_GONE: &str = "Client disconnected";
/// Close reason when the host's registry session is torn down.
pub const REASON_HOST_DISCONNECTED: &str = "Server disconnected";

/// State for a running interactive shell session.
pub struct RunningShell {
    /// Shell metadata
    pub info: ShellSessionInfo,
    /// Input side of the PTY stream
    pub input: mpsc::Sender<ShellCommand>,
    /// Stops the output forwarder
    pub cancel_token: CancellationToken,
}

/// Event pushed to the client of a shell session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Raw PTY output, forwarded verbatim
    Output(Vec<u8>),
    /// Final event; nothing follows it
    Closed { reason: String },
}

/// Client end of an interactive session. Dropping `events` closes the session.
pub struct ShellHandle {
    pub session_id: String,
    pub events: mpsc::Receiver<ShellEvent>,
}

/// Opens and tracks interactive shells on connected hosts.
pub struct ShellBridge {
    registry: Arc<dyn RemoteSessions>,
    shells: Arc<DashMapShellStorage>,
    clock: Arc<dyn Clock>,
    close_reasons: Arc<DashMap<String, String>>,
}

impl ShellBridge {
    pub fn new(registry: Arc<dyn RemoteSessions>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            shells: Arc::new(DashMapShellStorage::new()),
            clock,
            close_reasons: Arc::new(DashMap::new()),
        }
    }

    /// Open a PTY shell of `cols`×`rows` on a connected host.
    pub async fn open(&self, host_id: &str, cols: u32, rows: u32) -> Result<ShellHandle, FleetError> {
        validate_size(cols, rows)?;
        if !self.registry.is_connected(host_id) {
            return Err(FleetError::NotConnected(host_id.to_string()));
        }

        let ShellChannel { input, output } = self
            .registry
            .open_shell(host_id, PtySize { cols, rows })
            .await?;

        let session_id = Uuid::new_v4().to_string();
        let cancel_token = CancellationToken::new();
        self.shells.register(RunningShell {
            info: ShellSessionInfo {
                session_id: session_id.clone(),
                host_id: host_id.to_string(),
                cols,
                rows,
                created_at: self.clock.now_ms(),
            },
            input: input.clone(),
            cancel_token: cancel_token.clone(),
        });

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(forward_output(Forwarder {
            session_id: session_id.clone(),
            output,
            input,
            events: events_tx,
            cancel_token,
            shells: Arc::clone(&self.shells),
            close_reasons: Arc::clone(&self.close_reasons),
        }));

        info!(
            "Opened shell {} on host {} ({}x{})",
            session_id, host_id, cols, rows
        );
        Ok(ShellHandle {
            session_id,
            events: events_rx,
        })
    }

    /// Write client bytes to the shell unchanged.
    pub async fn send_input(&self, session_id: &str, data: Vec<u8>) -> Result<(), FleetError> {
        let input = self
            .shells
            .input(session_id)
            .ok_or_else(|| shell_not_found(session_id))?;
        input
            .send(ShellCommand::Data(data))
            .await
            .map_err(|_| FleetError::Command(format!("shell {} is closed", session_id)))
    }

    /// Remember the new size and signal a window change on the live stream.
    pub async fn resize(&self, session_id: &str, cols: u32, rows: u32) -> Result<(), FleetError> {
        validate_size(cols, rows)?;
        if !self.shells.set_size(session_id, cols, rows) {
            return Err(shell_not_found(session_id));
        }
        let input = self
            .shells
            .input(session_id)
            .ok_or_else(|| shell_not_found(session_id))?;
        input
            .send(ShellCommand::Resize(PtySize { cols, rows }))
            .await
            .map_err(|_| FleetError::Command(format!("shell {} is closed", session_id)))
    }

    /// End the remote stream and drop the session from the host index.
    pub async fn close(&self, session_id: &str, reason: &str) -> Result<(), FleetError> {
        // The reason must be in place before the forwarder can observe the cancel
        self.close_reasons
            .insert(session_id.to_string(), reason.to_string());
        let Some(shell) = self.shells.unregister(session_id) else {
            self.close_reasons.remove(session_id);
            return Err(shell_not_found(session_id));
        };

        shell.cancel_token.cancel();
        let _ = shell.input.send(ShellCommand::Close).await;
        info!(
            "Closed shell {} on host {}: {}",
            session_id, shell.info.host_id, reason
        );
        Ok(())
    }

    /// Close every shell on a host. Returns how many were closed.
    pub async fn close_all_for_host(&self, host_id: &str) -> usize {
        let mut closed = 0;
        for session_id in self.shells.list_by_host(host_id) {
            if self
                .close(&session_id, REASON_HOST_DISCONNECTED)
                .await
                .is_ok()
            {
                closed += 1;
            }
        }
        closed
    }

    pub fn sessions_for_host(&self, host_id: &str) -> Vec<ShellSessionInfo> {
        self.shells.list_filtered(Some(host_id))
    }

    pub fn session_info(&self, session_id: &str) -> Option<ShellSessionInfo> {
        self.shells.info(session_id)
    }

    pub fn list(&self, host_id: Option<&str>) -> Vec<ShellSessionInfo> {
        self.shells.list_filtered(host_id)
    }
}

fn validate_size(cols: u32, rows: u32) -> Result<(), FleetError> {
    if cols == 0 || rows == 0 {
        return Err(FleetError::Validation(format!(
            "terminal size must be positive, got {}x{}",
            cols, rows
        )));
    }
    Ok(())
}

fn shell_not_found(session_id: &str) -> FleetError {
    FleetError::NotFound(format!("shell session {}", session_id))
}

struct Forwarder {
    session_id: String,
    output: mpsc::Receiver<Vec<u8>>,
    input: mpsc::Sender<ShellCommand>,
    events: mpsc::Sender<ShellEvent>,
    cancel_token: CancellationToken,
    shells: Arc<DashMapShellStorage>,
    close_reasons: Arc<DashMap<String, String>>,
}

async fn forward_output(mut fwd: Forwarder) {
    let reason = loop {
        tokio::select! {
            _ = fwd.cancel_token.cancelled() => break None,
            _ = fwd.events.closed() => {
                let _ = fwd.input.send(ShellCommand::Close).await;
                break Some(REASON_CLIENT_GONE.to_string());
            }
            chunk = fwd.output.recv() => {
                let Some(bytes) = chunk else {
                    break Some(REASON_STREAM_ENDED.to_string());
                };
                tokio::select! {
                    _ = fwd.cancel_token.cancelled() => break None,
                    sent = fwd.events.send(ShellEvent::Output(bytes)) => {
                        if sent.is_err() {
                            let _ = fwd.input.send(ShellCommand::Close).await;
                            break Some(REASON_CLIENT_GONE.to_string());
                        }
                    }
                }
            }
        }
    };

    fwd.shells.unregister(&fwd.session_id);
    let requested = fwd
        .close_reasons
        .remove(&fwd.session_id)
        .map(|(_, reason)| reason);
    let reason = reason
        .or(requested)
        .unwrap_or_else(|| REASON_STREAM_ENDED.to_string());

    debug!("Shell {} forwarder finished: {}", fwd.session_id, reason);
    let closed = ShellEvent::Closed { reason };
    match tokio::time::timeout(CLOSE_EVENT_GRACE, fwd.events.send(closed)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => debug!("Shell {} client gone before close event", fwd.session_id),
        Err(_) => warn!("Shell {} client stalled, close event dropped", fwd.session_id),
    }
}
