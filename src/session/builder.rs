use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::build::{BuildBackend, BuildRequest};
use crate::config::BuilderConfig;
use crate::error::{BuildfarmError, Result};
use crate::heartbeat::{Acceptor, Connector, Link};
use crate::protocol::{BuildOutcome, ClientData};

pub const RECIPE_FILE: &str = "container.def";
pub const IMAGE_FILE: &str = "container.img";

/// Agent running on a builder machine. Serves one client session at a time.
pub struct BuilderServer {
    listener: Arc<TcpListener>,
    backend: BuildBackend,
    config: BuilderConfig,
}

impl BuilderServer {
    pub async fn bind(config: BuilderConfig) -> Result<Self> {
        config.heartbeat.validate()?;
        let listener = TcpListener::bind(config.listen_addr).await?;
        Ok(Self {
            listener: Arc::new(listener),
            backend: BuildBackend::new(config.backend.clone()),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve sessions until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            addr = %self.local_addr()?,
            backend = ?self.backend.kind(),
            "Builder listening"
        );
        tokio::fs::create_dir_all(&self.config.work_dir).await?;

        loop {
            let session_id = Uuid::new_v4();
            let span = tracing::info_span!("build_session", session_id = %session_id);

            let session = async {
                let mut link = Link::establish(
                    Acceptor::new(self.listener.clone()),
                    self.config.heartbeat.clone(),
                    self.config.protocol.clone(),
                )
                .await?;
                let work_dir = self.config.work_dir.join(format!("session-{}", session_id));
                let result = run_session(&mut link, &self.backend, &work_dir).await;
                link.close();
                result
            }
            .instrument(span.clone());

            tokio::select! {
                result = session => match result {
                    Ok(exit_code) => {
                        tracing::info!(parent: &span, exit_code, "Session finished");
                    }
                    Err(e) => {
                        tracing::warn!(parent: &span, error = %e, "Session failed");
                    }
                },
                _ = shutdown.cancelled() => {
                    tracing::info!("Builder shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Run one build for the client on the other end of `link`.
///
/// Receives the client data and recipe, streams every output line, ends the
/// stream with an empty string, reports the outcome, and sends the image when
/// the build succeeded. `work_dir` is created for the session and removed
/// afterwards whatever the result.
pub async fn run_session<C: Connector>(
    link: &mut Link<C>,
    backend: &BuildBackend,
    work_dir: &Path,
) -> Result<i32> {
    tokio::fs::create_dir_all(work_dir).await?;
    let result = build_in(link, backend, work_dir).await;
    if let Err(e) = tokio::fs::remove_dir_all(work_dir).await {
        tracing::warn!(work_dir = %work_dir.display(), error = %e, "Failed to remove work directory");
    }
    result
}

async fn build_in<C: Connector>(
    link: &mut Link<C>,
    backend: &BuildBackend,
    work_dir: &Path,
) -> Result<i32> {
    let client: ClientData = link.receive_record().await?;
    tracing::info!(user_id = %client.user_id, arch = %client.arch, tty = client.tty, "Client connected");

    let recipe: PathBuf = work_dir.join(RECIPE_FILE);
    let bytes = link.receive_file(&recipe).await?;
    tracing::info!(bytes, "Received recipe");

    let request = BuildRequest {
        recipe,
        image: work_dir.join(IMAGE_FILE),
        work_dir: work_dir.to_path_buf(),
        arch: client.arch,
        tty: client.tty,
    };
    let mut process = match backend.launch(&request) {
        Ok(process) => process,
        Err(e) => {
            link.send_error(&e.to_string()).await?;
            return Err(e);
        }
    };

    while let Some(line) = process.next_line().await? {
        link.send_string(&line).await?;
    }
    link.send_string("").await?;

    let exit_code = process.wait().await?;
    link.send_record(&BuildOutcome { exit_code }).await?;
    tracing::info!(exit_code, "Build finished");

    if exit_code == 0 {
        if !tokio::fs::try_exists(&request.image).await.unwrap_or(false) {
            let reason = "build succeeded but produced no image";
            link.send_error(reason).await?;
            return Err(BuildfarmError::Build(reason.to_string()));
        }
        let sent = link.send_file(&request.image).await?;
        tracing::info!(bytes = sent, "Image sent");
    }
    Ok(exit_code)
}
