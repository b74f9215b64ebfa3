use serde::{Deserialize, Serialize};

/// Sent by a client to the queue to ask for a builder.
pub const CHECKOUT_REQUEST: &str = "checkout_builder_request";
/// Sent by a client to the queue once it no longer needs its builder.
pub const CHECKOUT_COMPLETE: &str = "checkout_builder_complete";
/// Asks the queue for a [`BrokerStatus`](crate::broker::BrokerStatus) record.
pub const STATUS_REQUEST: &str = "queue_status_request";

/// Target architecture of the image being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Architecture {
    #[default]
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "ppc64le")]
    Ppc64le,
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::Ppc64le => write!(f, "ppc64le"),
        }
    }
}

impl std::str::FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" => Ok(Architecture::X86_64),
            "ppc64le" => Ok(Architecture::Ppc64le),
            other => Err(format!(
                "unsupported architecture '{}', expected x86_64 or ppc64le",
                other
            )),
        }
    }
}

/// First record a client sends to its builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientData {
    pub user_id: String,
    /// Whether the client's output is a terminal, so the build can be told so.
    pub tty: bool,
    pub arch: Architecture,
}

/// Sent by a builder after the end-of-output marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub exit_code: i32,
}

impl BuildOutcome {
    /// An image follows only for successful builds.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}
