use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::build::BackendKind;
use crate::error::{BuildfarmError, Result};

pub const DEFAULT_PORT: u16 = 8080;

/// What happens to a builder once the reservation holding it is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleasePolicy {
    /// Destroy the machine through the provisioning backend.
    #[default]
    Destroy,
    /// Return the machine to the free pool (fixed fleets).
    Recycle,
}

/// Limits governing how many builders the broker keeps alive.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Upper bound on free + held + provisioning + destroying builders.
    pub max_total_resources: usize,
    /// Upper bound on idle builders kept warm in the free pool.
    pub max_reserve_resources: usize,
    pub release_policy: ReleasePolicy,
    /// First delay applied after a failed create request.
    pub create_backoff_base_ms: u64,
    /// Ceiling for the exponential create backoff.
    pub create_backoff_max_ms: u64,
    /// Give up on a single create call after this long.
    pub create_timeout_ms: u64,
    /// How often the backend's live machine list is reconciled. `None` only
    /// reconciles once at startup.
    pub reconcile_interval_ms: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_total_resources: 5,
            max_reserve_resources: 2,
            release_policy: ReleasePolicy::Destroy,
            create_backoff_base_ms: 1_000,
            create_backoff_max_ms: 60_000,
            create_timeout_ms: 600_000,
            reconcile_interval_ms: Some(60_000),
        }
    }
}

impl BrokerConfig {
    pub fn new(max_total_resources: usize, max_reserve_resources: usize) -> Self {
        Self {
            max_total_resources,
            max_reserve_resources,
            ..Default::default()
        }
    }

    pub fn with_release_policy(mut self, release_policy: ReleasePolicy) -> Self {
        self.release_policy = release_policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_reserve_resources > self.max_total_resources {
            return Err(BuildfarmError::Config(format!(
                "max_reserve_resources ({}) exceeds max_total_resources ({})",
                self.max_reserve_resources, self.max_total_resources
            )));
        }
        if self.create_backoff_base_ms > self.create_backoff_max_ms {
            return Err(BuildfarmError::Config(
                "create backoff base exceeds its ceiling".to_string(),
            ));
        }
        Ok(())
    }
}

/// External commands implementing the provisioning contract.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Prints one JSON resource `{"id", "host", "port"}` on success.
    pub create_command: String,
    /// Invoked with the resource id appended as the final argument.
    pub destroy_command: String,
    /// Prints a JSON array of live resources.
    pub list_command: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            create_command: "/usr/local/bin/RequestCreateBuilder".to_string(),
            destroy_command: "/usr/local/bin/DestroyBuilder".to_string(),
            list_command: "/usr/local/bin/ListBuilders".to_string(),
        }
    }
}

/// Framing limits shared by every connection.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Largest slice of a file written or read per I/O call.
    pub chunk_size: usize,
    /// Largest accepted body for non-file messages.
    pub max_message_size: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Liveness settings for long-lived build links.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats sent by this side.
    pub pulse_interval_ms: u64,
    /// Nothing received for longer than this declares the connection hung.
    pub watchdog_timeout_ms: u64,
    /// Whether this side sends heartbeats at all.
    pub send_pulses: bool,
    /// Bound on a single reconnect attempt.
    pub reconnect_timeout_ms: u64,
    /// Number of replacement connections a link may open before giving up.
    pub max_reconnects: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pulse_interval_ms: 5_000,
            watchdog_timeout_ms: 10_000,
            send_pulses: true,
            reconnect_timeout_ms: 60_000,
            max_reconnects: 5,
        }
    }
}

impl HeartbeatConfig {
    pub fn pulse_interval(&self) -> Duration {
        Duration::from_millis(self.pulse_interval_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn with_pulses(mut self, send_pulses: bool) -> Self {
        self.send_pulses = send_pulses;
        self
    }

    /// The watchdog must outlast the pulse interval or a quiet but healthy
    /// peer would be declared hung between heartbeats.
    pub fn validate(&self) -> Result<()> {
        if self.pulse_interval_ms == 0 {
            return Err(BuildfarmError::Config(
                "pulse interval must be non-zero".to_string(),
            ));
        }
        if self.watchdog_timeout_ms <= self.pulse_interval_ms {
            return Err(BuildfarmError::Config(format!(
                "watchdog timeout ({}ms) must exceed pulse interval ({}ms)",
                self.watchdog_timeout_ms, self.pulse_interval_ms
            )));
        }
        Ok(())
    }
}

/// Queue server settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub listen_addr: SocketAddr,
    pub dashboard_addr: Option<SocketAddr>,
    pub broker: BrokerConfig,
    pub protocol: ProtocolConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            dashboard_addr: None,
            broker: BrokerConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

/// Builder agent settings.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub listen_addr: SocketAddr,
    pub backend: BackendKind,
    /// Parent directory for per-session scratch directories.
    pub work_dir: PathBuf,
    pub heartbeat: HeartbeatConfig,
    pub protocol: ProtocolConfig,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            backend: BackendKind::Singularity,
            work_dir: std::env::temp_dir().join("buildfarm"),
            heartbeat: HeartbeatConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Queue server address in `host:port` form.
    pub queue_addr: String,
    /// Attempts made to reach the queue before failing.
    pub connect_attempts: u32,
    pub connect_retry_ms: u64,
    pub heartbeat: HeartbeatConfig,
    pub protocol: ProtocolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            queue_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            connect_attempts: 5,
            connect_retry_ms: 1_000,
            heartbeat: HeartbeatConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(queue_host: &str, queue_port: u16) -> Self {
        Self {
            queue_addr: format!("{}:{}", queue_host, queue_port),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_config_default() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.max_total_resources, 5);
        assert_eq!(cfg.max_reserve_resources, 2);
        assert_eq!(cfg.release_policy, ReleasePolicy::Destroy);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn broker_config_rejects_reserve_above_total() {
        let cfg = BrokerConfig::new(2, 3);
        assert!(matches!(cfg.validate(), Err(BuildfarmError::Config(_))));
    }

    #[test]
    fn broker_config_with_release_policy() {
        let cfg = BrokerConfig::new(3, 0).with_release_policy(ReleasePolicy::Recycle);
        assert_eq!(cfg.release_policy, ReleasePolicy::Recycle);
        assert_eq!(cfg.max_total_resources, 3);
    }

    #[test]
    fn heartbeat_config_default_is_valid() {
        let cfg = HeartbeatConfig::default();
        assert_eq!(cfg.pulse_interval(), Duration::from_secs(5));
        assert_eq!(cfg.watchdog_timeout(), Duration::from_secs(10));
        assert!(cfg.send_pulses);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn heartbeat_config_rejects_watchdog_shorter_than_pulse() {
        let cfg = HeartbeatConfig {
            pulse_interval_ms: 15_000,
            watchdog_timeout_ms: 10_000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = HeartbeatConfig {
            pulse_interval_ms: 10_000,
            watchdog_timeout_ms: 10_000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn protocol_config_default() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.chunk_size, 16 * 1024);
        assert_eq!(cfg.max_message_size, 16 * 1024 * 1024);
    }

    #[test]
    fn queue_config_default_listens_on_8080() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:8080");
        assert!(cfg.dashboard_addr.is_none());
    }

    #[test]
    fn client_config_new() {
        let cfg = ClientConfig::new("queue.example.com", 9000);
        assert_eq!(cfg.queue_addr, "queue.example.com:9000");
        assert!(cfg.heartbeat.send_pulses);
    }

    #[test]
    fn provisioner_config_default_commands() {
        let cfg = ProvisionerConfig::default();
        assert_eq!(cfg.create_command, "/usr/local/bin/RequestCreateBuilder");
        assert_eq!(cfg.destroy_command, "/usr/local/bin/DestroyBuilder");
        assert_eq!(cfg.list_command, "/usr/local/bin/ListBuilders");
    }
}
