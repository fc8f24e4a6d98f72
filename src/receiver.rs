//! RPC receiver — dispatch loop over websocket links.
//!
//! DESIGN
//! ======
//! One task drives a `select!` loop over:
//! - the listen link's next frame → decode → cancel or invoke
//! - the send link's next frame (split mode only, so its closes are seen)
//! - the next settled call in the `JoinSet` → status out
//! - a close request from a [`CloseHandle`]
//!
//! Method executions run as tasks in a `JoinSet`, so they make progress
//! while the loop waits on the network or sleeps in reconnect back-off.
//! `Method::call` itself runs on the loop task; synchronous bodies block the
//! loop until they return. Panics at call time and while polling are caught
//! and reported as `err` statuses.
//!
//! LIFECYCLE
//! =========
//! `Connecting` → `Running` ⇄ `Reconnecting` → `Draining` → `Closed`.
//! A close frame with code 1000 on any link drains the receiver; any other
//! termination reconnects that link with back-off, leaving pending calls in
//! place. Draining cancels and aborts whatever is still in flight.

use std::collections::HashMap;
use std::fmt;
use std::future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use frames::{Command, Frame, Status};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::ReceiverConfig;
use crate::method::{CallContext, CancelSignal, MethodError, MethodFuture, MethodResult};
use crate::registry::MethodRegistry;
use crate::transport::{Closure, Endpoint, Incoming, Link, Links, SendFailure, TransportError};

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Connecting,
    Running,
    Reconnecting,
    Draining,
    Closed,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Requests shutdown of a running receiver from another task.
#[derive(Clone, Debug)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    /// Ask the receiver to drain and close. Idempotent.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }
}

/// In-flight call bookkeeping, keyed by uuid.
struct Pending {
    method: String,
    signal: CancelSignal,
    canceled: bool,
}

/// Output of a call task.
struct Settled {
    uuid: String,
    method: String,
    outcome: MethodResult,
}

/// What woke the loop.
enum Event {
    Listen(Incoming),
    Send(Incoming),
    Settled(Result<(task::Id, Settled), JoinError>),
    CloseRequested,
}

/// Whether the loop keeps going after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Drain,
}

/// Which link a reconnect targets.
#[derive(Debug, Clone, Copy)]
enum Side {
    Listen,
    Send,
}

// =============================================================================
// RECEIVER
// =============================================================================

pub struct RpcReceiver {
    config: ReceiverConfig,
    registry: MethodRegistry,
    links: Links,
    pending: HashMap<String, Pending>,
    calls: JoinSet<Settled>,
    /// Call task id to uuid, so a failed task still clears its entry.
    tasks: HashMap<task::Id, String>,
    state: ReceiverState,
    close_tx: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
}

impl RpcReceiver {
    /// Connect to the configured endpoint. No frame is read until [`RpcReceiver::run`].
    ///
    /// # Errors
    ///
    /// [`TransportError::Connect`] when a link cannot be established.
    pub async fn connect(config: ReceiverConfig, registry: MethodRegistry) -> Result<Self, TransportError> {
        info!(endpoint = %config.endpoint, state = %ReceiverState::Connecting, "receiver: state");
        let links = Links::connect(&config.endpoint).await?;
        let (close_tx, close_rx) = watch::channel(false);
        Ok(Self {
            config,
            registry,
            links,
            pending: HashMap::new(),
            calls: JoinSet::new(),
            tasks: HashMap::new(),
            state: ReceiverState::Connecting,
            close_tx: Arc::new(close_tx),
            close_rx,
        })
    }

    #[must_use]
    pub fn state(&self) -> ReceiverState {
        self.state
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.config.endpoint
    }

    /// Number of calls still executing.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            tx: Arc::clone(&self.close_tx),
        }
    }

    /// Serve commands until a link closes normally or a close is requested.
    ///
    /// A cancel command does not get its own reply. The canceled call's one
    /// status goes out when it settles, under the empty method name, carrying
    /// whatever the method returned after observing the cancel, or `null`
    /// when it outlived the cancel grace period and was dropped.
    ///
    /// # Errors
    ///
    /// [`TransportError::ReconnectExhausted`] when a dropped link cannot be
    /// re-established, [`TransportError::Send`] when a status cannot be sent
    /// even after reconnecting.
    pub async fn run(&mut self) -> Result<(), TransportError> {
        if self.state == ReceiverState::Closed {
            return Ok(());
        }
        self.set_state(ReceiverState::Running);
        let outcome = self.drive().await;
        if let Err(e) = &outcome {
            error!(error = %e, "receiver: transport failed");
        }
        self.drain().await;
        outcome
    }

    /// Drain and close. Idempotent; close-time errors are swallowed.
    pub async fn close(&mut self) {
        self.drain().await;
    }

    async fn drive(&mut self) -> Result<(), TransportError> {
        loop {
            let event = {
                let (listen, send) = self.links.split_mut();
                tokio::select! {
                    () = close_requested(&mut self.close_rx) => Event::CloseRequested,
                    incoming = listen.recv() => Event::Listen(incoming),
                    incoming = recv_or_pending(send) => Event::Send(incoming),
                    Some(joined) = self.calls.join_next_with_id() => Event::Settled(joined),
                }
            };

            let flow = match event {
                Event::Listen(incoming) => self.on_listen(incoming).await?,
                Event::Send(incoming) => self.on_send_link(incoming).await?,
                Event::Settled(joined) => self.on_settled(joined).await?,
                Event::CloseRequested => {
                    info!("receiver: close requested");
                    Flow::Drain
                }
            };
            if flow == Flow::Drain {
                return Ok(());
            }
        }
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    async fn on_listen(&mut self, incoming: Incoming) -> Result<Flow, TransportError> {
        match incoming {
            Incoming::Text(text) => self.dispatch(&text).await,
            Incoming::Malformed(reason) => {
                warn!(%reason, "receiver: rejected frame");
                self.send_status(Status::err_result("", reason)).await
            }
            Incoming::Closed(Closure::Normal) => {
                info!("receiver: listen link closed normally");
                Ok(Flow::Drain)
            }
            Incoming::Closed(Closure::Abnormal(reason)) => {
                warn!(%reason, "receiver: listen link dropped");
                self.reconnect(Side::Listen).await
            }
        }
    }

    async fn on_send_link(&mut self, incoming: Incoming) -> Result<Flow, TransportError> {
        match incoming {
            Incoming::Text(_) | Incoming::Malformed(_) => {
                debug!("receiver: ignoring inbound frame on send link");
                Ok(Flow::Continue)
            }
            Incoming::Closed(Closure::Normal) => {
                info!("receiver: send link closed normally");
                Ok(Flow::Drain)
            }
            Incoming::Closed(Closure::Abnormal(reason)) => {
                warn!(%reason, "receiver: send link dropped");
                self.reconnect(Side::Send).await
            }
        }
    }

    async fn dispatch(&mut self, text: &str) -> Result<Flow, TransportError> {
        debug!(len = text.len(), "receiver: frame in");
        match frames::decode(text) {
            Ok(Frame::Command(command)) if command.is_cancel() => self.cancel(command.uuid).await,
            Ok(Frame::Command(command)) => self.invoke(command).await,
            Ok(Frame::Status(status)) => {
                warn!(uuid = %status.uuid, "receiver: ignoring status frame");
                Ok(Flow::Continue)
            }
            Err(e) => {
                warn!(error = %e, "receiver: rejected frame");
                let (uuid, method) = salvage_identity(text);
                self.send_status(Status::err_result(&method, e.to_string()).with_uuid(uuid))
                    .await
            }
        }
    }

    async fn invoke(&mut self, command: Command) -> Result<Flow, TransportError> {
        let Command {
            method: name,
            arguments,
            uuid,
        } = command;

        if self.pending.contains_key(&uuid) {
            warn!(%uuid, method = %name, "receiver: duplicate uuid");
            let status = Status::err_result(&name, format!("call '{uuid}' is already pending")).with_uuid(uuid);
            return self.send_status(status).await;
        }

        let method = match self.registry.get(&name) {
            Ok(method) => method,
            Err(e) => {
                warn!(%uuid, method = %name, "receiver: unknown method");
                let status = Status::err_result(&name, e.to_string()).with_uuid(uuid);
                return self.send_status(status).await;
            }
        };

        let (signal, ctx) = CallContext::pair(&uuid, &name);
        let started = panic::catch_unwind(AssertUnwindSafe(|| method.call(arguments, ctx.clone())));
        let future = match started {
            Ok(future) => future,
            Err(payload) => {
                let e = MethodError::from_panic(payload.as_ref());
                warn!(%uuid, method = %name, error = %e, "receiver: method panicked");
                let status = Status::err_result(&name, e.to_string()).with_uuid(uuid);
                return self.send_status(status).await;
            }
        };

        debug!(%uuid, method = %name, "receiver: call started");
        self.pending.insert(
            uuid.clone(),
            Pending {
                method: name.clone(),
                signal,
                canceled: false,
            },
        );
        let call = self.calls.spawn(run_guarded(uuid.clone(), name, future, ctx, self.config.cancel_grace));
        self.tasks.insert(call.id(), uuid);
        Ok(Flow::Continue)
    }

    async fn cancel(&mut self, uuid: String) -> Result<Flow, TransportError> {
        match self.pending.get_mut(&uuid) {
            Some(pending) if pending.canceled => {
                debug!(%uuid, "receiver: call already canceled");
                Ok(Flow::Continue)
            }
            Some(pending) => {
                info!(%uuid, method = %pending.method, "receiver: canceling call");
                pending.canceled = true;
                pending.signal.cancel();
                Ok(Flow::Continue)
            }
            None => {
                warn!(%uuid, "receiver: cancel for unknown call");
                let status = Status::err_result("", format!("no pending call '{uuid}'")).with_uuid(uuid);
                self.send_status(status).await
            }
        }
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    async fn on_settled(&mut self, joined: Result<(task::Id, Settled), JoinError>) -> Result<Flow, TransportError> {
        let settled = match joined {
            Ok((id, settled)) => {
                self.tasks.remove(&id);
                settled
            }
            Err(e) => return self.on_task_failed(&e).await,
        };
        let canceled = self.pending.remove(&settled.uuid).is_some_and(|p| p.canceled);
        debug!(uuid = %settled.uuid, method = %settled.method, canceled, "receiver: call settled");
        let status = settled_status(&settled.method, &settled.uuid, settled.outcome, canceled);
        self.send_status(status).await
    }

    /// A call task that died without settling: drop its entry and report it.
    async fn on_task_failed(&mut self, e: &JoinError) -> Result<Flow, TransportError> {
        let Some(uuid) = self.tasks.remove(&e.id()) else {
            error!(error = %e, "receiver: unknown call task failed");
            return Ok(Flow::Continue);
        };
        let method = self.pending.remove(&uuid).map(|p| p.method).unwrap_or_default();
        error!(%uuid, %method, error = %e, "receiver: call task failed");
        let status = Status::err_result(&method, format!("call task failed: {e}")).with_uuid(uuid);
        self.send_status(status).await
    }

    /// Send one status. An abnormal failure reconnects the send side and
    /// retries exactly once.
    async fn send_status(&mut self, status: Status) -> Result<Flow, TransportError> {
        let text = status.to_json();
        debug!(uuid = %status.uuid, status = %status.status, "receiver: frame out");

        match self.links.sender_mut().send_text(&text).await {
            Ok(()) => return Ok(Flow::Continue),
            Err(SendFailure::Closed) => return Ok(Flow::Drain),
            Err(SendFailure::Broken(e)) => {
                warn!(uuid = %status.uuid, error = %e, "receiver: send failed; reconnecting");
            }
        }

        if self.reconnect(Side::Send).await? == Flow::Drain {
            return Ok(Flow::Drain);
        }
        let sender = self.links.sender_mut();
        let retried = sender.send_text(&text).await;
        match retried {
            Ok(()) => Ok(Flow::Continue),
            Err(SendFailure::Closed) => Ok(Flow::Drain),
            Err(SendFailure::Broken(e)) => Err(TransportError::Send {
                url: sender.url().to_owned(),
                source: Box::new(e),
            }),
        }
    }

    /// Reconnect one link with back-off. A close request ends the attempt
    /// early and drains.
    async fn reconnect(&mut self, side: Side) -> Result<Flow, TransportError> {
        self.set_state(ReceiverState::Reconnecting);
        let link = match side {
            Side::Listen => self.links.listen_mut(),
            Side::Send => self.links.sender_mut(),
        };
        tokio::select! {
            reconnected = link.reconnect(&self.config.reconnect) => reconnected?,
            () = close_requested(&mut self.close_rx) => {
                info!(?side, "receiver: close requested while reconnecting");
                return Ok(Flow::Drain);
            }
        }
        self.set_state(ReceiverState::Running);
        Ok(Flow::Continue)
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    async fn drain(&mut self) {
        if self.state == ReceiverState::Closed {
            return;
        }
        self.set_state(ReceiverState::Draining);

        for pending in self.pending.values() {
            pending.signal.cancel();
        }
        self.calls.shutdown().await;
        self.tasks.clear();
        if !self.pending.is_empty() {
            info!(count = self.pending.len(), "receiver: aborted in-flight calls");
            self.pending.clear();
        }

        self.links.close().await;
        self.set_state(ReceiverState::Closed);
    }

    fn set_state(&mut self, state: ReceiverState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "receiver: state");
            self.state = state;
        }
    }
}

impl fmt::Debug for RpcReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcReceiver")
            .field("endpoint", &self.config.endpoint)
            .field("state", &self.state)
            .field("in_flight", &self.pending.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Execute one call, catching panics and bounding its life after cancellation.
async fn run_guarded(uuid: String, method: String, future: MethodFuture, ctx: CallContext, grace: Duration) -> Settled {
    let outcome = tokio::select! {
        biased;
        caught = AssertUnwindSafe(future).catch_unwind() => {
            caught.unwrap_or_else(|payload| Err(MethodError::from_panic(payload.as_ref())))
        }
        () = cancel_deadline(&ctx, grace) => Err(MethodError::Canceled),
    };
    Settled { uuid, method, outcome }
}

async fn cancel_deadline(ctx: &CallContext, grace: Duration) {
    ctx.cancelled().await;
    tokio::time::sleep(grace).await;
}

async fn close_requested(rx: &mut watch::Receiver<bool>) {
    let requested = rx.wait_for(|requested| *requested).await.is_ok();
    if !requested {
        future::pending::<()>().await;
    }
}

async fn recv_or_pending(link: Option<&mut Link>) -> Incoming {
    match link {
        Some(link) => link.recv().await,
        None => future::pending().await,
    }
}

/// Status reported for a settled call. Canceled calls report under the empty
/// method name; a call dropped after the grace period reports `null`.
fn settled_status(method: &str, uuid: &str, outcome: MethodResult, canceled: bool) -> Status {
    let name = if canceled { "" } else { method };
    let status = match outcome {
        Ok(value) => Status::ok_result(name, value),
        Err(MethodError::Canceled) => Status::ok_result("", Value::Null),
        Err(e) => Status::err_result(name, e.to_string()),
    };
    status.with_uuid(uuid)
}

/// Best-effort uuid and method of an undecodable frame; a fresh uuid and the
/// empty method when absent.
fn salvage_identity(text: &str) -> (String, String) {
    let value = serde_json::from_str::<Value>(text).unwrap_or(Value::Null);
    let field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_owned);
    let uuid = field(frames::FIELD_UUID).unwrap_or_else(frames::new_uuid);
    let method = field(frames::FIELD_METHOD).unwrap_or_default();
    (uuid, method)
}

#[cfg(test)]
#[path = "receiver_test.rs"]
mod tests;
