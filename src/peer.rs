//! Script peer — the counterpart endpoint a receiver connects to.
//!
//! DESIGN
//! ======
//! A peer is driven by a [`Script`]: frames to push to the receiver
//! (`input`) and statuses it expects back (`output`). It serves three
//! websocket routes on one listener:
//! - `/receive_from_server`: pushes every input frame (split listen side)
//! - `/send_to_server`: collects statuses (split send side)
//! - `/rpc`: both, for duplex receivers
//!
//! Each received status must match an outstanding expected one on status,
//! payload and uuid. A match removes it; when none remain the verdict is
//! [`Verdict::Passed`]. An unexpected or undecodable frame fails the script.
//! Once a verdict exists every open socket is closed with code 1000, which
//! drains the receiver.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use axum::routing::get;
use frames::{FormatError, Status};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::Endpoint;

pub const PATH_LISTEN: &str = "/receive_from_server";
pub const PATH_SEND: &str = "/send_to_server";
pub const PATH_DUPLEX: &str = "/rpc";

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// The script line is not `{"input": [..], "output": [..]}` with string lists.
    #[error("invalid script: {0}")]
    Script(#[from] serde_json::Error),
    /// An expected output is not a valid status.
    #[error("expected output #{index} is not a status: {source}")]
    Expected {
        index: usize,
        #[source]
        source: FormatError,
    },
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// The receiver sent something the script did not expect.
    #[error("script failed: {0}")]
    Unexpected(String),
    /// The verdict did not arrive in time.
    #[error("timed out with {remaining} expected statuses outstanding")]
    Timeout { remaining: usize },
}

// =============================================================================
// SCRIPT
// =============================================================================

/// Frames to push and statuses to expect.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Script {
    pub input: Vec<String>,
    pub output: Vec<String>,
}

impl Script {
    /// Parse a one-line JSON script.
    ///
    /// # Errors
    ///
    /// [`PeerError::Script`] unless both `input` and `output` are lists of strings.
    pub fn from_line(line: &str) -> Result<Self, PeerError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Outcome of a script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed(String),
}

impl Verdict {
    /// # Errors
    ///
    /// [`PeerError::Unexpected`] for a failed script.
    pub fn into_result(self) -> Result<(), PeerError> {
        match self {
            Self::Passed => Ok(()),
            Self::Failed(reason) => Err(PeerError::Unexpected(reason)),
        }
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct Progress {
    expected: Vec<Status>,
    received: Vec<Status>,
}

struct Shared {
    input: Vec<String>,
    progress: Mutex<Progress>,
    verdict: watch::Sender<Option<Verdict>>,
}

impl Shared {
    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn conclude(&self, verdict: Verdict) {
        let concluded = self.verdict.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(verdict.clone());
            true
        });
        if concluded {
            match &verdict {
                Verdict::Passed => info!("peer: script passed"),
                Verdict::Failed(reason) => warn!(%reason, "peer: script failed"),
            }
        }
    }

    /// Check one inbound frame against the outstanding expectations.
    fn judge(&self, text: &str) {
        let status = match Status::from_json(text) {
            Ok(status) => status,
            Err(e) => {
                self.conclude(Verdict::Failed(format!("undecodable frame {text:?}: {e}")));
                return;
            }
        };
        debug!(uuid = %status.uuid, "peer: status in");

        let outcome = {
            let mut progress = self.progress();
            progress.received.push(status.clone());
            let hit = progress
                .expected
                .iter()
                .position(|want| *want == status && want.uuid == status.uuid);
            match hit {
                Some(index) => {
                    progress.expected.remove(index);
                    progress.expected.is_empty().then_some(Verdict::Passed)
                }
                None => Some(Verdict::Failed(format!("unexpected status {}", status.to_json()))),
            }
        };
        if let Some(verdict) = outcome {
            self.conclude(verdict);
        }
    }
}

// =============================================================================
// PEER
// =============================================================================

/// A running script peer. The server stops when the peer is dropped.
pub struct ScriptPeer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    server: JoinHandle<()>,
}

impl ScriptPeer {
    /// Bind `addr` (port 0 picks a free port) and start serving `script`.
    ///
    /// # Errors
    ///
    /// [`PeerError::Expected`] for an output that is not a status and
    /// [`PeerError::Bind`] when the listener cannot be bound.
    pub async fn spawn(script: Script, addr: SocketAddr) -> Result<Self, PeerError> {
        let expected = script
            .output
            .iter()
            .enumerate()
            .map(|(index, text)| Status::from_json(text).map_err(|source| PeerError::Expected { index, source }))
            .collect::<Result<Vec<_>, _>>()?;

        let initial = expected.is_empty().then_some(Verdict::Passed);
        let (verdict, _) = watch::channel(initial);
        let shared = Arc::new(Shared {
            input: script.input,
            progress: Mutex::new(Progress {
                expected,
                received: Vec::new(),
            }),
            verdict,
        });

        let listener = TcpListener::bind(addr).await.map_err(|source| PeerError::Bind { addr, source })?;
        let addr = listener.local_addr().map_err(|source| PeerError::Bind { addr, source })?;

        let app = Router::new()
            .route(PATH_LISTEN, get(handle_listen))
            .route(PATH_SEND, get(handle_send))
            .route(PATH_DUPLEX, get(handle_duplex))
            .with_state(Arc::clone(&shared));
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "peer: server stopped");
            }
        });
        info!(%addr, "peer: listening");

        Ok(Self { addr, shared, server })
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint for a split receiver.
    #[must_use]
    pub fn split_endpoint(&self) -> Endpoint {
        Endpoint::Split {
            listen: self.url(PATH_LISTEN),
            send: self.url(PATH_SEND),
        }
    }

    /// Endpoint for a duplex receiver.
    #[must_use]
    pub fn duplex_endpoint(&self) -> Endpoint {
        Endpoint::Duplex(self.url(PATH_DUPLEX))
    }

    fn url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }

    /// Statuses received so far, in arrival order.
    #[must_use]
    pub fn received(&self) -> Vec<Status> {
        self.shared.progress().received.clone()
    }

    /// Number of expected statuses not yet seen.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.shared.progress().expected.len()
    }

    /// Wait for the verdict.
    ///
    /// # Errors
    ///
    /// [`PeerError::Timeout`] with the number of outstanding statuses.
    pub async fn wait(&self, timeout: Duration) -> Result<Verdict, PeerError> {
        let mut rx = self.shared.verdict.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            match rx.wait_for(Option::is_some).await {
                Ok(verdict) => verdict.clone(),
                Err(_) => None,
            }
        })
        .await;
        match waited {
            Ok(Some(verdict)) => Ok(verdict),
            Ok(None) | Err(_) => Err(PeerError::Timeout {
                remaining: self.remaining(),
            }),
        }
    }
}

impl Drop for ScriptPeer {
    fn drop(&mut self) {
        self.server.abort();
    }
}

// =============================================================================
// ROUTES
// =============================================================================

#[derive(Clone, Copy, Debug)]
enum Role {
    Listen,
    Send,
    Duplex,
}

impl Role {
    fn pushes_input(self) -> bool {
        matches!(self, Self::Listen | Self::Duplex)
    }

    fn collects_status(self) -> bool {
        matches!(self, Self::Send | Self::Duplex)
    }
}

async fn handle_listen(State(shared): State<Arc<Shared>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, shared, Role::Listen))
}

async fn handle_send(State(shared): State<Arc<Shared>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, shared, Role::Send))
}

async fn handle_duplex(State(shared): State<Arc<Shared>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, shared, Role::Duplex))
}

async fn run_socket(mut socket: WebSocket, shared: Arc<Shared>, role: Role) {
    info!(?role, "peer: receiver connected");
    let mut verdict = shared.verdict.subscribe();

    if role.pushes_input() {
        for frame in &shared.input {
            if let Err(e) = socket.send(Message::Text(frame.clone().into())).await {
                warn!(?role, error = %e, "peer: push failed");
                return;
            }
        }
        debug!(?role, count = shared.input.len(), "peer: input pushed");
    }

    loop {
        tokio::select! {
            () = concluded(&mut verdict) => {
                let close = Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: Utf8Bytes::from_static("script complete"),
                }));
                if let Err(e) = socket.send(close).await {
                    debug!(?role, error = %e, "peer: close failed");
                }
                break;
            }
            msg = socket.recv() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                };
                if role.collects_status() {
                    shared.judge(&text);
                } else {
                    shared.conclude(Verdict::Failed(format!("frame on listen-only socket: {text:?}")));
                }
            }
        }
    }
    info!(?role, "peer: receiver disconnected");
}

async fn concluded(rx: &mut watch::Receiver<Option<Verdict>>) {
    let reached = rx.wait_for(Option::is_some).await.is_ok();
    if !reached {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
#[path = "peer_test.rs"]
mod tests;
