//! Transport links — websocket client connections used by the receiver.
//!
//! DESIGN
//! ======
//! A [`Link`] wraps one `tokio-tungstenite` client stream and reduces the
//! websocket message zoo to what the receiver cares about: a text frame, a
//! frame that cannot be text, or a closure. Closures are classified once,
//! here: only a close frame carrying code 1000 is [`Closure::Normal`]; a
//! missing code, any other code, a stream that ends without a close frame and
//! every I/O or protocol error are [`Closure::Abnormal`] and trigger a
//! reconnect upstream.
//!
//! [`Links`] holds the one (duplex) or two (split) links of an [`Endpoint`].

use std::fmt;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::reconnect::{ReconnectPolicy, retry};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The initial connection could not be established.
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },
    /// Every reconnect attempt failed.
    #[error("reconnect to {url} gave up after {attempts} attempts: {source}")]
    ReconnectExhausted {
        url: String,
        attempts: u32,
        #[source]
        source: Box<tungstenite::Error>,
    },
    /// A send failed again after reconnecting.
    #[error("send to {url} failed: {source}")]
    Send {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },
    /// The link was closed normally and cannot carry more frames.
    #[error("link to {url} is closed")]
    Closed { url: String },
}

// =============================================================================
// ENDPOINT
// =============================================================================

/// Where the receiver connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// One connection carries commands in and statuses out.
    Duplex(String),
    /// Commands arrive on `listen`, statuses leave on `send`.
    Split { listen: String, send: String },
}

impl Endpoint {
    #[must_use]
    pub fn listen_url(&self) -> &str {
        match self {
            Self::Duplex(url) | Self::Split { listen: url, .. } => url,
        }
    }

    #[must_use]
    pub fn send_url(&self) -> &str {
        match self {
            Self::Duplex(url) | Self::Split { send: url, .. } => url,
        }
    }

    #[must_use]
    pub fn is_split(&self) -> bool {
        matches!(self, Self::Split { .. })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplex(url) => write!(f, "duplex {url}"),
            Self::Split { listen, send } => write!(f, "listen {listen} / send {send}"),
        }
    }
}

// =============================================================================
// LINK
// =============================================================================

/// How a link stopped delivering frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closure {
    /// Close frame with code 1000.
    Normal,
    /// Anything else, with a description for logs.
    Abnormal(String),
}

/// One inbound event from a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    /// A binary frame that is not UTF-8.
    Malformed(String),
    Closed(Closure),
}

/// Why a send did not go out.
#[derive(Debug)]
pub enum SendFailure {
    /// The link saw a normal close earlier.
    Closed,
    /// The connection broke.
    Broken(tungstenite::Error),
}

/// One websocket client connection.
pub struct Link {
    url: String,
    role: &'static str,
    stream: WsStream,
    closed: Option<Closure>,
}

impl Link {
    /// Open a connection to `url`. `role` only labels log lines.
    ///
    /// # Errors
    ///
    /// [`TransportError::Connect`] when the handshake fails.
    pub async fn connect(url: &str, role: &'static str) -> Result<Self, TransportError> {
        let stream = open(url).await.map_err(|e| TransportError::Connect {
            url: url.to_owned(),
            source: Box::new(e),
        })?;
        info!(url, role, "transport: connected");
        Ok(Self {
            url: url.to_owned(),
            role,
            stream,
            closed: None,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn closure(&self) -> Option<&Closure> {
        self.closed.as_ref()
    }

    /// Next text frame or closure. Control frames are skipped. Cancel-safe.
    pub async fn recv(&mut self) -> Incoming {
        if let Some(closure) = &self.closed {
            return Incoming::Closed(closure.clone());
        }
        loop {
            let incoming = match self.stream.next().await {
                Some(Ok(Message::Text(text))) => Incoming::Text(text.as_str().to_owned()),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Incoming::Text(text),
                    Err(e) => Incoming::Malformed(format!("binary frame is not utf-8: {e}")),
                },
                Some(Ok(Message::Close(Some(frame)))) if frame.code == CloseCode::Normal => Incoming::Closed(Closure::Normal),
                Some(Ok(Message::Close(Some(frame)))) => {
                    Incoming::Closed(Closure::Abnormal(format!("close code {}", u16::from(frame.code))))
                }
                Some(Ok(Message::Close(None))) => Incoming::Closed(Closure::Abnormal("close without code".into())),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(e)) => Incoming::Closed(Closure::Abnormal(e.to_string())),
                None => Incoming::Closed(Closure::Abnormal("stream ended without close frame".into())),
            };
            if let Incoming::Closed(closure) = &incoming {
                debug!(url = %self.url, role = self.role, ?closure, "transport: link closed");
                self.closed = Some(closure.clone());
            }
            return incoming;
        }
    }

    /// Send one text frame.
    ///
    /// # Errors
    ///
    /// [`SendFailure::Closed`] after a normal close, [`SendFailure::Broken`]
    /// when the write fails.
    pub async fn send_text(&mut self, text: &str) -> Result<(), SendFailure> {
        if self.closed == Some(Closure::Normal) {
            return Err(SendFailure::Closed);
        }
        self.stream
            .send(Message::text(text.to_owned()))
            .await
            .map_err(SendFailure::Broken)
    }

    /// Replace the connection, retrying per `policy`.
    ///
    /// # Errors
    ///
    /// [`TransportError::ReconnectExhausted`] once every attempt failed.
    pub async fn reconnect(&mut self, policy: &ReconnectPolicy) -> Result<(), TransportError> {
        warn!(url = %self.url, role = self.role, "transport: reconnecting");
        let url = self.url.clone();
        let stream = retry(policy, |_| open(&url))
            .await
            .map_err(|exhausted| TransportError::ReconnectExhausted {
                url: url.clone(),
                attempts: exhausted.attempts,
                source: Box::new(exhausted.last_error),
            })?;
        self.stream = stream;
        self.closed = None;
        info!(url = %self.url, role = self.role, "transport: reconnected");
        Ok(())
    }

    /// Close the connection. Errors are logged and swallowed.
    ///
    /// After a close frame from the peer the reply is already queued, so
    /// flushing it completes the handshake.
    pub async fn close(&mut self) {
        let closed = if self.closed.is_some() {
            self.stream.flush().await
        } else {
            self.stream.close(None).await
        };
        if let Err(e) = closed {
            debug!(url = %self.url, role = self.role, error = %e, "transport: close failed");
        }
    }
}

async fn open(url: &str) -> Result<WsStream, tungstenite::Error> {
    let (stream, _response) = connect_async(url).await?;
    Ok(stream)
}

// =============================================================================
// LINKS
// =============================================================================

/// The connections of one endpoint.
pub struct Links {
    listen: Link,
    send: Option<Link>,
}

impl Links {
    /// Connect every link of `endpoint`, send side first.
    ///
    /// # Errors
    ///
    /// [`TransportError::Connect`] for the first link that fails.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        match endpoint {
            Endpoint::Duplex(url) => Ok(Self {
                listen: Link::connect(url, "duplex").await?,
                send: None,
            }),
            Endpoint::Split { listen, send } => {
                let send = Link::connect(send, "send").await?;
                let listen = Link::connect(listen, "listen").await?;
                Ok(Self {
                    listen,
                    send: Some(send),
                })
            }
        }
    }

    pub fn listen_mut(&mut self) -> &mut Link {
        &mut self.listen
    }

    /// Link statuses go out on: the send link in split mode, else the duplex link.
    pub fn sender_mut(&mut self) -> &mut Link {
        self.send.as_mut().unwrap_or(&mut self.listen)
    }

    /// Listen link and, in split mode, the send link.
    pub fn split_mut(&mut self) -> (&mut Link, Option<&mut Link>) {
        (&mut self.listen, self.send.as_mut())
    }

    /// Close every link best-effort.
    pub async fn close(&mut self) {
        if let Some(send) = self.send.as_mut() {
            send.close().await;
        }
        self.listen.close().await;
    }
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
