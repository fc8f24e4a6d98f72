//! Shared frame model and JSON codec for the websocket RPC transport.
//!
//! This crate owns the wire representation used by the receiver, the script
//! peer and the CLI. A frame is one flat JSON object per websocket text
//! message: either a [`Command`] (a call request) or a [`Status`] (its
//! outcome). Both carry a `uuid` that correlates a Status back to the Command
//! that produced it; equality on both types ignores the uuid.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Command key holding the method name.
pub const FIELD_METHOD: &str = "method";

/// Command key holding the named arguments.
pub const FIELD_ARGUMENTS: &str = "arguments";

/// Correlation key present on both frame kinds.
pub const FIELD_UUID: &str = "uuid";

/// Status key holding the `ok` / `err` token.
pub const FIELD_STATUS: &str = "status";

/// Status key holding the outcome payload.
pub const FIELD_PAYLOAD: &str = "payload";

/// Result payload key holding the return value or error message.
pub const FIELD_RESULT: &str = "result";

/// Named call arguments. Alias to reduce noise in signatures.
pub type Arguments = Map<String, Value>;

// =============================================================================
// ERRORS
// =============================================================================

/// Malformed command data, or a call to a method nobody registered.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame text is not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// The frame is valid JSON but not an object.
    #[error("frame has to be a json object")]
    NotAnObject,
    /// A required key is absent.
    #[error("the given json object has a missing key ({0})")]
    MissingField(&'static str),
    /// A key is present with the wrong JSON type.
    #[error("{field} has to be {expected}")]
    InvalidType {
        field: &'static str,
        expected: &'static str,
    },
    /// No method with this name is registered.
    #[error("unknown function '{0}'")]
    UnknownMethod(String),
}

/// Malformed status data.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// The frame text is not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// The frame is valid JSON but not an object.
    #[error("status has to be a json object")]
    NotAnObject,
    /// A required key is absent.
    #[error("missing field in status ({0})")]
    MissingField(&'static str),
    /// The status token is neither `ok` nor `err`.
    #[error("status only accepts `ok` or `err`, got {0}")]
    InvalidStatus(String),
    /// A key is present with the wrong JSON type.
    #[error("{field} has to be {expected}")]
    InvalidType {
        field: &'static str,
        expected: &'static str,
    },
    /// The payload could not be converted into JSON.
    #[error("payload is not serializable: {0}")]
    Payload(serde_json::Error),
}

/// Error returned by [`decode`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Format(#[from] FormatError),
}

// =============================================================================
// COMMAND
// =============================================================================

/// A request to execute a named method with named arguments.
///
/// An empty `method` is reserved: such a command is a cancellation signal for
/// the in-flight call that shares its `uuid`.
#[derive(Clone, Debug)]
pub struct Command {
    pub method: String,
    pub arguments: Arguments,
    pub uuid: String,
}

impl Command {
    /// Create a command with a freshly generated uuid.
    pub fn new(method: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            method: method.into(),
            arguments,
            uuid: new_uuid(),
        }
    }

    /// Create a cancellation signal for the call correlated by `uuid`.
    pub fn cancel(uuid: impl Into<String>) -> Self {
        Self {
            method: String::new(),
            arguments: Arguments::new(),
            uuid: uuid.into(),
        }
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    #[must_use]
    pub fn is_cancel(&self) -> bool {
        self.method.is_empty()
    }

    /// Encode into a JSON object string.
    #[must_use]
    pub fn to_json(&self) -> String {
        let mut object = Map::new();
        object.insert(FIELD_METHOD.into(), Value::String(self.method.clone()));
        object.insert(FIELD_ARGUMENTS.into(), Value::Object(self.arguments.clone()));
        object.insert(FIELD_UUID.into(), Value::String(self.uuid.clone()));
        Value::Object(object).to_string()
    }

    /// Decode a command from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for invalid JSON, missing keys, or keys with
    /// the wrong type.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Build a command from an already parsed JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for missing keys or keys with the wrong type.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let arguments = match object.remove(FIELD_ARGUMENTS) {
            Some(Value::Object(arguments)) => arguments,
            Some(_) => {
                return Err(ProtocolError::InvalidType {
                    field: FIELD_ARGUMENTS,
                    expected: "an object",
                });
            }
            None => return Err(ProtocolError::MissingField(FIELD_ARGUMENTS)),
        };
        let method = take_string(&mut object, FIELD_METHOD)?;
        let uuid = take_string(&mut object, FIELD_UUID)?;

        Ok(Self {
            method,
            arguments,
            uuid,
        })
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method && self.arguments == other.arguments
    }
}

fn take_string(object: &mut Arguments, field: &'static str) -> Result<String, ProtocolError> {
    match object.remove(field) {
        Some(Value::String(value)) => Ok(value),
        Some(_) => Err(ProtocolError::InvalidType {
            field,
            expected: "a string",
        }),
        None => Err(ProtocolError::MissingField(field)),
    }
}

// =============================================================================
// STATUS
// =============================================================================

/// Outcome token of a [`Status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    Ok,
    Err,
}

impl StatusKind {
    /// Wire token for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Err => "err",
        }
    }
}

impl FromStr for StatusKind {
    type Err = FormatError;

    fn from_str(token: &str) -> Result<Self, FormatError> {
        match token {
            "ok" => Ok(Self::Ok),
            "err" => Ok(Self::Err),
            other => Err(FormatError::InvalidStatus(other.to_owned())),
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an executed command, correlated to it by `uuid`.
#[derive(Clone, Debug)]
pub struct Status {
    pub status: StatusKind,
    pub payload: Value,
    pub uuid: String,
}

impl Status {
    /// Create a status from a raw token.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidStatus`] unless `token` is `ok` or `err`.
    pub fn new(token: &str, payload: Value) -> Result<Self, FormatError> {
        let status = token.parse()?;
        Ok(Self::with_kind(status, payload))
    }

    /// Successful status with a fresh uuid.
    pub fn ok(payload: impl Into<Value>) -> Self {
        Self::with_kind(StatusKind::Ok, payload.into())
    }

    /// Failed status with a fresh uuid.
    pub fn err(payload: impl Into<Value>) -> Self {
        Self::with_kind(StatusKind::Err, payload.into())
    }

    /// Successful status from any serializable payload.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Payload`] when the payload has no JSON form.
    pub fn ok_from<T: Serialize + ?Sized>(payload: &T) -> Result<Self, FormatError> {
        let payload = serde_json::to_value(payload).map_err(FormatError::Payload)?;
        Ok(Self::ok(payload))
    }

    /// Failed status from any serializable payload.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Payload`] when the payload has no JSON form.
    pub fn err_from<T: Serialize + ?Sized>(payload: &T) -> Result<Self, FormatError> {
        let payload = serde_json::to_value(payload).map_err(FormatError::Payload)?;
        Ok(Self::err(payload))
    }

    /// Successful `{"method", "result"}` reply for a call.
    pub fn ok_result(method: &str, result: impl Into<Value>) -> Self {
        Self::ok(result_payload(method, result.into()))
    }

    /// Failed `{"method", "result"}` reply carrying an error message.
    pub fn err_result(method: &str, message: impl Into<String>) -> Self {
        Self::err(result_payload(method, Value::String(message.into())))
    }

    fn with_kind(status: StatusKind, payload: Value) -> Self {
        Self {
            status,
            payload,
            uuid: new_uuid(),
        }
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == StatusKind::Ok
    }

    #[must_use]
    pub fn is_err(&self) -> bool {
        self.status == StatusKind::Err
    }

    /// Encode into a JSON object string.
    #[must_use]
    pub fn to_json(&self) -> String {
        let mut object = Map::new();
        object.insert(FIELD_STATUS.into(), Value::String(self.status.as_str().to_owned()));
        object.insert(FIELD_PAYLOAD.into(), self.payload.clone());
        object.insert(FIELD_UUID.into(), Value::String(self.uuid.clone()));
        Value::Object(object).to_string()
    }

    /// Decode a status from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] for invalid JSON, missing keys, an invalid
    /// status token, or a non-string uuid.
    pub fn from_json(text: &str) -> Result<Self, FormatError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Build a status from an already parsed JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] for missing keys, an invalid status token, or
    /// a non-string uuid.
    pub fn from_value(value: Value) -> Result<Self, FormatError> {
        let Value::Object(mut object) = value else {
            return Err(FormatError::NotAnObject);
        };

        let status = match object.remove(FIELD_STATUS) {
            Some(Value::String(token)) => token.parse()?,
            Some(other) => return Err(FormatError::InvalidStatus(other.to_string())),
            None => return Err(FormatError::MissingField(FIELD_STATUS)),
        };
        let payload = object
            .remove(FIELD_PAYLOAD)
            .ok_or(FormatError::MissingField(FIELD_PAYLOAD))?;
        let uuid = match object.remove(FIELD_UUID) {
            Some(Value::String(uuid)) => uuid,
            Some(_) => {
                return Err(FormatError::InvalidType {
                    field: FIELD_UUID,
                    expected: "a string",
                });
            }
            None => return Err(FormatError::MissingField(FIELD_UUID)),
        };

        Ok(Self {
            status,
            payload,
            uuid,
        })
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.status == other.status && self.payload == other.payload
    }
}

/// Build the `{"method": .., "result": ..}` payload carried by call replies.
#[must_use]
pub fn result_payload(method: &str, result: Value) -> Value {
    let mut object = Map::new();
    object.insert(FIELD_METHOD.into(), Value::String(method.to_owned()));
    object.insert(FIELD_RESULT.into(), result);
    Value::Object(object)
}

/// Generate a correlation id: a v4 uuid as 32 lowercase hex digits.
#[must_use]
pub fn new_uuid() -> String {
    Uuid::new_v4().simple().to_string()
}

// =============================================================================
// FRAME
// =============================================================================

/// Either kind of message on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Command(Command),
    Status(Status),
}

impl Frame {
    /// Correlation id of the wrapped message.
    #[must_use]
    pub fn uuid(&self) -> &str {
        match self {
            Self::Command(command) => &command.uuid,
            Self::Status(status) => &status.uuid,
        }
    }
}

impl From<Command> for Frame {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<Status> for Frame {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

/// Encode a frame as JSON text.
#[must_use]
pub fn encode(frame: &Frame) -> String {
    match frame {
        Frame::Command(command) => command.to_json(),
        Frame::Status(status) => status.to_json(),
    }
}

/// Decode JSON text into a frame. Objects carrying a `status` key are
/// statuses; everything else is validated as a command.
///
/// # Errors
///
/// Returns [`CodecError::Protocol`] for malformed commands and
/// [`CodecError::Format`] for malformed statuses.
pub fn decode(text: &str) -> Result<Frame, CodecError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::from)?;
    let is_status = value.as_object().is_some_and(|o| o.contains_key(FIELD_STATUS));
    if is_status {
        Ok(Frame::Status(Status::from_value(value)?))
    } else {
        Ok(Frame::Command(Command::from_value(value)?))
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
