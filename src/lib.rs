//! wsrpc — asynchronous RPC receiver over websockets.
//!
//! DESIGN
//! ======
//! A [`MethodRegistry`] maps names to async handlers. An [`RpcReceiver`]
//! connects to a duplex or split [`Endpoint`], decodes inbound commands,
//! runs them concurrently and sends each outcome back as a status correlated
//! by uuid. Calls can be canceled by uuid; dropped links are re-established
//! with exponential back-off while calls keep running.
//!
//! The wire model lives in the `frames` crate and is re-exported here.

pub mod config;
pub mod method;
pub mod peer;
pub mod receiver;
pub mod reconnect;
pub mod registry;
pub mod transport;

pub use config::{ConfigError, ReceiverConfig};
pub use frames::{Arguments, Command, Frame, FormatError, ProtocolError, Status, StatusKind};
pub use method::{CallContext, CancelSignal, Method, MethodError, MethodFuture, MethodResult, ReceiverError, arg};
pub use peer::{PeerError, Script, ScriptPeer, Verdict};
pub use receiver::{CloseHandle, ReceiverState, RpcReceiver};
pub use reconnect::{ReconnectPolicy, RetryExhausted};
pub use registry::{MethodRegistry, RegistryError};
pub use transport::{Endpoint, TransportError};
