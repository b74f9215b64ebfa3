use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::broker::{BrokerStatus, Resource};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::heartbeat::{Connector, Link, Resolver};
use crate::protocol::message::{CHECKOUT_COMPLETE, CHECKOUT_REQUEST, STATUS_REQUEST};
use crate::protocol::{Architecture, BuildOutcome, ClientData, Messenger};

/// One image to build.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub recipe: PathBuf,
    pub image: PathBuf,
    pub arch: Architecture,
    pub tty: bool,
    pub user_id: String,
}

impl BuildJob {
    pub fn new(recipe: impl Into<PathBuf>, image: impl Into<PathBuf>) -> Self {
        Self {
            recipe: recipe.into(),
            image: image.into(),
            arch: Architecture::default(),
            tty: false,
            user_id: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        }
    }

    pub fn with_arch(mut self, arch: Architecture) -> Self {
        self.arch = arch;
        self
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }
}

fn resolver(config: &ClientConfig, addr: impl Into<String>) -> Resolver {
    Resolver::new(addr).with_retries(
        config.connect_attempts,
        Duration::from_millis(config.connect_retry_ms),
    )
}

async fn connect_queue(config: &ClientConfig) -> Result<Messenger<TcpStream>> {
    let stream = resolver(config, config.queue_addr.clone()).connect().await?;
    Ok(Messenger::new(stream, config.protocol.clone()))
}

/// Check out a builder, run `job` on it, and copy its output to `output`.
///
/// Returns the build's exit code. On success the image has been written to
/// `job.image`. The builder is released when this returns, whether or not the
/// build succeeded.
pub async fn run_build<W>(config: &ClientConfig, job: &BuildJob, output: &mut W) -> Result<i32>
where
    W: AsyncWrite + Unpin,
{
    let mut queue = connect_queue(config).await?;
    queue.send_string(CHECKOUT_REQUEST).await?;
    tracing::info!(queue = %config.queue_addr, "Waiting for a builder");

    let resource: Resource = queue.receive_record().await?;
    tracing::info!(resource = %resource, "Builder assigned");

    let outcome = build_on(config, job, &resource, output).await;

    if let Err(e) = queue.send_string(CHECKOUT_COMPLETE).await {
        tracing::warn!(error = %e, "Failed to notify queue, builder is released on disconnect");
    }
    outcome
}

async fn build_on<W>(
    config: &ClientConfig,
    job: &BuildJob,
    resource: &Resource,
    output: &mut W,
) -> Result<i32>
where
    W: AsyncWrite + Unpin,
{
    let mut link = Link::establish(
        resolver(config, resource.address()),
        config.heartbeat.clone(),
        config.protocol.clone(),
    )
    .await?;

    link.send_record(&ClientData {
        user_id: job.user_id.clone(),
        tty: job.tty,
        arch: job.arch,
    })
    .await?;
    let bytes = link.send_file(&job.recipe).await?;
    tracing::debug!(bytes, recipe = %job.recipe.display(), "Recipe sent");

    loop {
        let line = link.receive_string().await?;
        if line.is_empty() {
            break;
        }
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
    }

    let outcome: BuildOutcome = link.receive_record().await?;
    if outcome.succeeded() {
        let bytes = link.receive_file(&job.image).await?;
        tracing::info!(bytes, image = %job.image.display(), "Image received");
    } else {
        tracing::warn!(exit_code = outcome.exit_code, "Build failed");
    }

    if link.reconnects() > 0 {
        tracing::info!(reconnects = link.reconnects(), "Build survived reconnects");
    }
    link.close();
    Ok(outcome.exit_code)
}

/// Ask the queue for a snapshot of its builders.
pub async fn fetch_status(config: &ClientConfig) -> Result<BrokerStatus> {
    let mut queue = connect_queue(config).await?;
    queue.send_string(STATUS_REQUEST).await?;
    queue.receive_record().await
}
