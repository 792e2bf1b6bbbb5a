//! Bridge error types

use thiserror::Error;

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// The peer raised an exception while evaluating, executing or calling.
    #[error("{type_name}: {message}")]
    Evaluation {
        type_name: String,
        message: String,
        traceback: String,
    },

    /// The handle belongs to a peer that has stopped, or to another bridge.
    #[error("Remote handle {id} does not belong to the running peer process")]
    StaleHandle { id: u64 },

    #[error("Peer invoked unknown callback '{name}'")]
    UnknownCallback { name: String },

    #[error("Callback nesting exceeded {depth} levels")]
    CallbackDepthExceeded { depth: usize },

    #[error("Peer process is not alive: {0}")]
    ProcessNotAlive(String),

    /// Malformed or unexpected traffic on the protocol stream. Fatal to the
    /// peer instance that produced it.
    #[error("Protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("Failed to spawn peer interpreter '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A host callback failed; the message is forwarded to the peer.
    #[error("Callback failed: {0}")]
    Callback(String),

    /// A `Bridge` method was called from inside one of its own sessions on
    /// the same thread.
    #[error("Bridge re-entered from its own session; use the Session passed to the callback")]
    Reentrant,

    #[error("Cannot encode value: {0}")]
    Encode(String),

    #[error("Unsupported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn framing(detail: impl Into<String>) -> Self {
        BridgeError::ProtocolFraming(detail.into())
    }

    pub fn not_alive(reason: impl Into<String>) -> Self {
        BridgeError::ProcessNotAlive(reason.into())
    }

    pub fn callback(message: impl Into<String>) -> Self {
        BridgeError::Callback(message.into())
    }

    /// Python exception type name used when this error is raised inside the peer.
    pub fn peer_type_name(&self) -> &str {
        match self {
            BridgeError::Evaluation { type_name, .. } => type_name,
            BridgeError::UnknownCallback { .. } => "UnknownCallbackError",
            BridgeError::CallbackDepthExceeded { .. } => "RecursionError",
            BridgeError::StaleHandle { .. } => "StaleHandleError",
            _ => "HostCallbackError",
        }
    }

    /// Whether the peer process was torn down as a consequence of this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::ProcessNotAlive(_) | BridgeError::ProtocolFraming(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluation_display() {
        let err = BridgeError::Evaluation {
            type_name: "ZeroDivisionError".to_string(),
            message: "division by zero".to_string(),
            traceback: String::new(),
        };
        assert_eq!(err.to_string(), "ZeroDivisionError: division by zero");
        assert_eq!(err.peer_type_name(), "ZeroDivisionError");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(BridgeError::framing("bad tag").is_fatal());
        assert!(BridgeError::not_alive("eof").is_fatal());
        assert!(!BridgeError::StaleHandle { id: 3 }.is_fatal());
    }
}
