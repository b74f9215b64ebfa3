//! Shared fakes for integration tests.
//!
//! Provides an in-memory provisioning backend and a connector that hands out
//! pre-built duplex streams.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::time::Instant;

use buildfarm::broker::Resource;
use buildfarm::error::{BuildfarmError, Result};
use buildfarm::heartbeat::Connector;
use buildfarm::provision::ProvisioningBackend;

#[derive(Default)]
struct FakeState {
    next_id: u32,
    live: Vec<Resource>,
    create_calls: Vec<Instant>,
    destroyed: Vec<String>,
    failing_creates: u32,
    fail_destroys: bool,
    fixed_fleet: bool,
}

/// Provisioning backend that creates builders pointing at `host:port`.
#[derive(Clone)]
pub struct FakeProvisioner {
    host: String,
    port: String,
    state: Arc<Mutex<FakeState>>,
}

#[allow(dead_code)]
impl FakeProvisioner {
    pub fn new() -> Self {
        Self::pointing_at("127.0.0.1", 8080)
    }

    pub fn pointing_at(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port: port.to_string(),
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    /// Fail the next `count` create calls.
    pub fn fail_creates(&self, count: u32) {
        self.state.lock().unwrap().failing_creates = count;
    }

    pub fn fail_destroys(&self, fail: bool) {
        self.state.lock().unwrap().fail_destroys = fail;
    }

    /// Report that no machine can ever be created, like a static pool.
    pub fn fixed_fleet(&self) {
        self.state.lock().unwrap().fixed_fleet = true;
    }

    /// Pretend a machine already exists before the broker starts.
    pub fn seed(&self, id: &str) {
        let resource = Resource::new(id, self.host.clone(), self.port.clone());
        self.state.lock().unwrap().live.push(resource);
    }

    pub fn create_calls(&self) -> Vec<Instant> {
        self.state.lock().unwrap().create_calls.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn live_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .live
            .iter()
            .map(|r| r.id.clone())
            .collect()
    }
}

#[async_trait]
impl ProvisioningBackend for FakeProvisioner {
    async fn list_active(&self) -> Result<Vec<Resource>> {
        Ok(self.state.lock().unwrap().live.clone())
    }

    async fn create_one(&self) -> Result<Resource> {
        let mut state = self.state.lock().unwrap();
        state.create_calls.push(Instant::now());
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(BuildfarmError::Provisioning("quota exceeded".to_string()));
        }
        state.next_id += 1;
        let resource = Resource::new(
            format!("fake-{}", state.next_id),
            self.host.clone(),
            self.port.clone(),
        );
        state.live.push(resource.clone());
        Ok(resource)
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_destroys {
            return Err(BuildfarmError::Provisioning(format!("cannot destroy {}", id)));
        }
        state.live.retain(|r| r.id != id);
        state.destroyed.push(id.to_string());
        Ok(())
    }

    fn can_create(&self) -> bool {
        !self.state.lock().unwrap().fixed_fleet
    }
}

/// Connector that yields queued in-memory streams, one per connect.
pub struct DuplexConnector {
    streams: VecDeque<DuplexStream>,
}

#[allow(dead_code)]
impl DuplexConnector {
    /// Returns the connector and the peer ends of `count` connections, in
    /// the order they will be handed out.
    pub fn with_connections(count: usize) -> (Self, Vec<DuplexStream>) {
        let mut streams = VecDeque::new();
        let mut peers = Vec::new();
        for _ in 0..count {
            let (local, remote) = tokio::io::duplex(64 * 1024);
            streams.push_back(local);
            peers.push(remote);
        }
        (Self { streams }, peers)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    type Stream = DuplexStream;

    async fn connect(&mut self) -> Result<DuplexStream> {
        self.streams
            .pop_front()
            .ok_or_else(|| BuildfarmError::Connection("no more connections".to_string()))
    }

    fn peer(&self) -> String {
        "duplex".to_string()
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition().await
}
