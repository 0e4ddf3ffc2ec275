//! IPC protocol for worker communication.
//!
//! Messages are JSON-serialized and newline-delimited. Every envelope carries
//! an `owner` tag; lines that do not parse or that belong to another owner are
//! not farm traffic and are ignored by the receiving side.

use crate::error::RemoteError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of a worker within one farm. Never reused.
pub type WorkerId = u64;

/// Owner tag of controller requests and call results.
pub const FARM_OWNER: &str = "farm";

/// Owner tag of the async-init ready signal.
pub const CHILD_OWNER: &str = "farm-child";

/// Marker identifying an encoded error in a result's first argument.
pub const ERROR_MARKER: &str = "$error";

/// Request from controller to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Load the target module. Sent once, right after spawn.
    Load { module: String },

    /// Invoke an exported function.
    Call {
        idx: usize,
        worker_id: WorkerId,
        /// Export name; `None` selects the module's default export.
        #[serde(default)]
        method: Option<String>,
        args: Vec<Value>,
    },

    /// Graceful shutdown request.
    Die,
}

/// Message from worker to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Async-init handshake: the module finished initialising.
    Ready,

    /// Call completion. `args[0]` is null or an encoded error.
    Result {
        idx: usize,
        worker_id: WorkerId,
        args: Vec<Value>,
    },
}

impl ControlMessage {
    /// Create a call request.
    pub fn call(idx: usize, worker_id: WorkerId, method: Option<String>, args: Vec<Value>) -> Self {
        Self::Call {
            idx,
            worker_id,
            method,
            args,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        to_line(FARM_OWNER, self)
    }

    /// Deserialize from JSON line. `None` if the line is not a farm request.
    pub fn from_line(line: &str) -> Option<Self> {
        from_line(line, |_| FARM_OWNER)
    }
}

impl WorkerMessage {
    /// Create a completion from a call outcome.
    pub fn result(idx: usize, worker_id: WorkerId, outcome: Result<Vec<Value>, WireError>) -> Self {
        Self::Result {
            idx,
            worker_id,
            args: encode_outcome(outcome),
        }
    }

    /// The owner tag this message travels under.
    pub fn owner(&self) -> &'static str {
        match self {
            Self::Ready => CHILD_OWNER,
            Self::Result { .. } => FARM_OWNER,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        to_line(self.owner(), self)
    }

    /// Deserialize from JSON line. `None` if the line is not farm traffic.
    pub fn from_line(line: &str) -> Option<Self> {
        from_line(line, WorkerMessage::owner)
    }
}

fn to_line<T: Serialize>(owner: &str, message: &T) -> String {
    let mut value = serde_json::to_value(message).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.insert("owner".into(), Value::String(owner.into()));
    }
    let mut json = value.to_string();
    json.push('\n');
    json
}

fn from_line<T, F>(line: &str, expected_owner: F) -> Option<T>
where
    T: for<'de> Deserialize<'de>,
    F: Fn(&T) -> &'static str,
{
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let owner = value.get("owner")?.as_str()?.to_owned();
    let message: T = serde_json::from_value(value).ok()?;
    (owner == expected_owner(&message)).then_some(message)
}

/// Wire encoding of an error raised inside a worker.
///
/// ```text
/// {"$error":"$error","type":"TypeError","message":"...","stack":null,"foo":"bar"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(rename = "$error")]
    marker: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    /// Custom fields attached by the module.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl WireError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            marker: ERROR_MARKER.to_string(),
            kind: kind.into(),
            message: message.into(),
            stack: None,
            fields: Map::new(),
        }
    }

    fn is_error_value(value: &Value) -> bool {
        value.get(ERROR_MARKER).and_then(Value::as_str) == Some(ERROR_MARKER)
    }
}

impl From<WireError> for RemoteError {
    fn from(e: WireError) -> Self {
        RemoteError::from_parts(e.kind, e.message, e.stack, e.fields)
    }
}

/// Encode a call outcome as `[error-or-null, ...results]`.
pub fn encode_outcome(outcome: Result<Vec<Value>, WireError>) -> Vec<Value> {
    match outcome {
        Ok(results) => {
            let mut args = Vec::with_capacity(results.len() + 1);
            args.push(Value::Null);
            args.extend(results);
            args
        }
        Err(e) => vec![serde_json::to_value(e).unwrap_or(Value::Null)],
    }
}

/// Decode `[error-or-null, ...results]` back into a call outcome.
///
/// A first argument that is not an encoded error is treated as the success
/// slot and dropped.
pub fn decode_outcome(mut args: Vec<Value>) -> Result<Vec<Value>, RemoteError> {
    if args.is_empty() {
        return Ok(args);
    }
    let first = args.remove(0);
    if WireError::is_error_value(&first) {
        let wire: WireError = serde_json::from_value(first).unwrap_or_else(|e| {
            WireError::new("Error", format!("Malformed error from worker: {}", e))
        });
        return Err(wire.into());
    }
    Ok(args)
}
