//! `switchboard-types` – shared wire vocabulary.
//!
//! Everything that crosses a socket between the Hub, the Workers and the web
//! front-end is a [`Frame`]: a `{type, id?, data}` JSON envelope. This crate
//! defines the envelope, the typed payloads carried in `data`, the
//! [`WireCodec`] that turns frames into WebSocket text and back, and the
//! [`BridgeError`] taxonomy used by every other crate in the workspace.

pub mod codec;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use codec::WireCodec;

/// Positional RPC / command arguments.
pub type Args = Vec<Value>;

/// Keyword RPC arguments.
pub type Kwargs = Map<String, Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Frame envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Discriminant of a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Hub → Worker: one upstream event taken from the work queue.
    Start,
    /// Worker → Hub: run a named operation against the upstream connection.
    Request,
    /// Successful reply to a `request`.
    Ok,
    /// Failed reply to a `request` or `access`; `data` holds diagnostic text.
    Error,
    /// Front-end → Worker: one HTTP request to resolve.
    Access,
    /// Worker → front-end: the response descriptor for an `access`.
    End,
}

/// The only unit exchanged over a Switchboard connection.
///
/// `id` is a correlation id. Frames without one follow the strict
/// one-request-at-a-time discipline: the next reply is the answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    fn new(kind: FrameKind, id: Option<u64>, data: Value) -> Self {
        Self { kind, id, data }
    }

    /// Build a `start` frame wrapping one upstream event.
    pub fn start(event: StartData) -> Self {
        Self::new(FrameKind::Start, None, to_value(event))
    }

    /// Build a `request` frame.
    pub fn request(id: Option<u64>, request: RequestData) -> Self {
        Self::new(FrameKind::Request, id, to_value(request))
    }

    /// Build an `ok` reply.
    pub fn ok(id: Option<u64>, result: Value) -> Self {
        Self::new(FrameKind::Ok, id, result)
    }

    /// Build an `error` reply carrying diagnostic text.
    pub fn error(id: Option<u64>, diagnostic: impl Into<String>) -> Self {
        Self::new(FrameKind::Error, id, Value::String(diagnostic.into()))
    }

    /// Build an `access` frame for the web bridge.
    pub fn access(id: Option<u64>, access: AccessData) -> Self {
        Self::new(FrameKind::Access, id, to_value(access))
    }

    /// Build an `end` frame carrying a response descriptor.
    pub fn end(id: Option<u64>, descriptor: ResponseDescriptor) -> Self {
        Self::new(FrameKind::End, id, to_value(descriptor))
    }

    /// Decode `data` into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Codec`] when `data` does not match `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, BridgeError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| BridgeError::Codec(format!("bad {:?} payload: {e}", self.kind)))
    }

    /// Diagnostic text of an `error` frame (or the JSON of any other frame).
    pub fn error_text(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

// Payload structs only contain JSON-representable fields, so this cannot fail.
fn to_value<T: Serialize>(payload: T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// `data` of a `start` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartData {
    /// Event name, e.g. `"message_create"`.
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default)]
    pub data: Value,
    /// Identity of the upstream account the Hub is logged in as.
    #[serde(default)]
    pub me: Value,
}

/// `data` of a `request` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    /// Operation name resolved by the Hub's request proxy.
    #[serde(rename = "type")]
    pub op: String,
    #[serde(default)]
    pub args: Args,
    #[serde(default)]
    pub kwargs: Kwargs,
    /// When `false` the Hub acknowledges immediately and runs the operation
    /// in the background.
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

/// `data` of an `access` frame: one HTTP request seen by the front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessData {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub ip: String,
    pub host: String,
    pub port: u16,
    /// Absolute URL (`http://host:port/path?query`).
    pub url: String,
    /// Path plus query string.
    pub uri: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

fn default_method() -> String {
    "GET".to_string()
}

impl AccessData {
    /// Path component of `uri` (query string removed).
    pub fn path(&self) -> &str {
        self.uri.split_once('?').map_or(self.uri.as_str(), |(p, _)| p)
    }

    /// Raw query string of `uri`, if any.
    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }
}

/// Names the response constructor the front-end should invoke.
///
/// Workers never render output themselves; they describe it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseDescriptor {
    /// One of `text`, `html`, `json`, `redirect`, `empty`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Args,
    #[serde(default)]
    pub kwargs: Kwargs,
}

impl ResponseDescriptor {
    pub fn new(kind: impl Into<String>, args: Args, kwargs: Kwargs) -> Self {
        Self {
            kind: kind.into(),
            args,
            kwargs,
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new("text", vec![Value::String(body.into())], Kwargs::new())
    }

    pub fn html(body: impl Into<String>) -> Self {
        Self::new("html", vec![Value::String(body.into())], Kwargs::new())
    }

    pub fn json(body: Value) -> Self {
        Self::new("json", vec![body], Kwargs::new())
    }

    pub fn redirect(location: impl Into<String>) -> Self {
        Self::new("redirect", vec![Value::String(location.into())], Kwargs::new())
    }

    pub fn empty() -> Self {
        Self::new("empty", Args::new(), Kwargs::new())
    }

    /// Set the HTTP status code (builder-style).
    pub fn with_status(mut self, status: u16) -> Self {
        self.kwargs.insert("status".to_string(), Value::from(status));
        self
    }

    /// Add a response header (builder-style).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let headers = self
            .kwargs
            .entry("headers")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = headers {
            map.insert(name.into(), Value::String(value.into()));
        }
        self
    }

    /// Status requested through `kwargs.status`, if any.
    pub fn status(&self) -> Option<u16> {
        self.kwargs
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error taxonomy shared by the Hub, the Workers and the front-end.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Dialing, accepting or talking to a peer failed.
    #[error("Connection failure: {0}")]
    Connection(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected to the hub yet")]
    NotConnected,

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// An operation name was rejected at registration time.
    #[error("Invalid operation registration '{name}': {reason}")]
    InvalidOperation { name: String, reason: String },

    /// A local handler failed; the text is the full diagnostic.
    #[error("Handler failed:\n{0}")]
    Handler(String),

    /// The Hub replied `error`; the text is the Hub-side diagnostic.
    #[error("Remote error in request:\n{0}")]
    Remote(String),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin already loaded: {0}")]
    DuplicatePlugin(String),

    #[error("Extension not found: {0}")]
    ExtensionNotFound(String),

    /// `remove_event` / `remove_command` / `remove_route` on a missing entry.
    #[error("Handler not registered: {0}")]
    HandlerNotFound(String),

    #[error("Cannot convert argument '{param}' from {value:?}: {reason}")]
    Conversion {
        param: String,
        value: String,
        reason: String,
    },

    #[error("Wire codec error: {0}")]
    Codec(String),

    #[error("Timed out waiting for reply to '{0}'")]
    Timeout(String),
}

/// Render an error and its whole `source()` chain as multi-line text.
///
/// This is what gets shipped in `error` frames so the remote side sees the
/// full context.
pub fn diagnostic(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str("\n  caused by: ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
