//! Framed wire protocol shared by the queue, builders and clients.
//!
//! Every message is a fixed nine byte header followed by its body:
//!
//! ```text
//! [length: u64 big-endian][type: u8][body: length bytes]
//! ```
//!
//! `file` messages carry a four byte big-endian CRC-32C trailer computed over
//! the body. `heartbeat` messages have an empty body and are skipped by the
//! `*_ignoring_heartbeat` receive helpers.
//!
//! # Components
//!
//! - [`codec`]: header encoding, typed send/receive, string and JSON records
//! - [`file`]: chunked file streaming with a running checksum
//! - [`message`]: request strings and record types exchanged by sessions

pub mod codec;
pub mod file;
pub mod message;

pub use codec::{Header, Messenger, HEADER_LEN};
pub use file::Checksum;
pub use message::{Architecture, BuildOutcome, ClientData};

/// Type tag carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    String,
    Record,
    File,
    Heartbeat,
    Error,
}

impl MessageType {
    pub fn tag(self) -> u8 {
        match self {
            MessageType::String => 0,
            MessageType::Record => 1,
            MessageType::File => 2,
            MessageType::Heartbeat => 3,
            MessageType::Error => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MessageType::String),
            1 => Some(MessageType::Record),
            2 => Some(MessageType::File),
            3 => Some(MessageType::Heartbeat),
            4 => Some(MessageType::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::String => write!(f, "string"),
            MessageType::Record => write!(f, "record"),
            MessageType::File => write!(f, "file"),
            MessageType::Heartbeat => write!(f, "heartbeat"),
            MessageType::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for kind in [
            MessageType::String,
            MessageType::Record,
            MessageType::File,
            MessageType::Heartbeat,
            MessageType::Error,
        ] {
            assert_eq!(MessageType::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(MessageType::from_tag(5), None);
    }
}
