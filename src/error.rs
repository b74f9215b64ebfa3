use thiserror::Error;

use crate::protocol::MessageType;

/// Failures of a single framed exchange.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("expected {expected} message, received {actual}")]
    TypeMismatch {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("unknown message type tag {0}")]
    UnknownType(u8),

    #[error("message body of {size} bytes exceeds limit of {limit} bytes")]
    Oversized { size: u64, limit: u64 },

    #[error("peer reported error: {0}")]
    Remote(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("transport closed mid-message: {0}")]
    Closed(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum BuildfarmError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    Integrity { expected: u32, actual: u32 },

    #[error("Provisioning error: {0}")]
    Provisioning(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Broker invariant violated: {0}")]
    BrokerInvariant(String),

    #[error("Broker is not running")]
    BrokerStopped,

    #[error("Build error: {0}")]
    Build(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BuildfarmError {
    /// True when the underlying connection is unusable and a fresh one should
    /// be established before retrying.
    pub fn is_connection_fault(&self) -> bool {
        match self {
            BuildfarmError::Connection(_) => true,
            BuildfarmError::Protocol(ProtocolError::Closed(_)) => true,
            BuildfarmError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildfarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_transport_is_a_connection_fault() {
        let err: BuildfarmError = ProtocolError::Closed(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof",
        ))
        .into();
        assert!(err.is_connection_fault());
    }

    #[test]
    fn type_mismatch_is_not_a_connection_fault() {
        let err: BuildfarmError = ProtocolError::TypeMismatch {
            expected: MessageType::String,
            actual: MessageType::File,
        }
        .into();
        assert!(!err.is_connection_fault());
        assert_eq!(
            err.to_string(),
            "Protocol error: expected string message, received file"
        );
    }

    #[test]
    fn integrity_error_formats_checksums() {
        let err = BuildfarmError::Integrity {
            expected: 0xdeadbeef,
            actual: 0x1,
        };
        assert_eq!(
            err.to_string(),
            "Checksum mismatch: expected 0xdeadbeef, computed 0x00000001"
        );
    }
}
