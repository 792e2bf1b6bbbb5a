//! JSON-RPC message types
//!
//! One JSON object per line on stdin, one reply per line on stdout.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Request from a client to pyrelay-server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    /// Start the peer interpreter (a no-op if it is running)
    #[serde(rename = "start")]
    Start,

    /// Stop the peer; every handle the server holds becomes invalid
    #[serde(rename = "stop")]
    Stop,

    #[serde(rename = "alive")]
    Alive,

    /// Evaluate an expression
    #[serde(rename = "eval")]
    Eval {
        expr: String,
        #[serde(default)]
        remote: bool,
    },

    /// Execute statements
    #[serde(rename = "exec")]
    Exec { code: String },

    /// Call a named callable
    #[serde(rename = "call")]
    Call {
        name: String,
        #[serde(default)]
        args: Vec<Json>,
        #[serde(default)]
        kwargs: Map<String, Json>,
        #[serde(default)]
        remote: bool,
    },

    #[serde(rename = "getattr")]
    GetAttr {
        handle: u64,
        name: String,
        #[serde(default)]
        remote: bool,
    },

    #[serde(rename = "setattr")]
    SetAttr { handle: u64, name: String, value: Json },

    /// Drop the server's reference to a handle
    #[serde(rename = "release")]
    Release { handle: u64 },

    /// Execute statements and return what they printed
    #[serde(rename = "capture")]
    Capture { code: String },

    /// Stop the peer and exit
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Response from pyrelay-server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Value {
        value: Json,
    },
    Captured {
        output: String,
    },
    Alive {
        alive: bool,
        pid: Option<u32>,
        version: Option<String>,
    },
    Success {
        ok: bool,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
}

impl Response {
    pub fn success() -> Self {
        Response::Success { ok: true }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error {
            error: msg.into(),
            kind: None,
        }
    }

    pub fn value(value: Json) -> Self {
        Response::Value { value }
    }
}

/// JSON-RPC message wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage<T> {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(flatten)]
    pub content: T,
}

impl<T> RpcMessage<T> {
    pub fn new(id: u64, content: T) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            content,
        }
    }
}
