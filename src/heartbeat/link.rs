use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{DuplexStream, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{HeartbeatConfig, ProtocolConfig};
use crate::error::{BuildfarmError, Result};
use crate::heartbeat::connector::Connector;
use crate::heartbeat::watchdog::{spawn_pulse, spawn_pump, spawn_watchdog, Metered, PIPE_CAPACITY};
use crate::protocol::{codec, file, MessageType};

/// One live connection plus the tasks watching it.
struct Channel<S> {
    reader: Mutex<DuplexStream>,
    writer: Arc<Mutex<WriteHalf<Metered<S>>>>,
    hung: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<S> Channel<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    fn open(stream: S, config: &HeartbeatConfig) -> Self {
        let (metered, activity) = Metered::new(stream);
        let (socket, writer) = tokio::io::split(metered);
        let writer = Arc::new(Mutex::new(writer));
        let (pipe_in, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let hung = CancellationToken::new();

        let mut tasks = vec![
            spawn_pump(socket, pipe_in),
            spawn_watchdog(activity, config.watchdog_timeout(), hung.clone()),
        ];
        if config.send_pulses {
            tasks.push(spawn_pulse(
                writer.clone(),
                config.pulse_interval(),
                hung.clone(),
            ));
        }

        Self {
            reader: Mutex::new(reader),
            writer,
            hung,
            tasks,
        }
    }
}

impl<S> Drop for Channel<S> {
    fn drop(&mut self) {
        self.hung.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A framed connection that survives hangs and resets.
///
/// Each operation runs against the current connection. If the watchdog
/// declares the connection hung, or the transport fails mid-frame, the
/// connection is torn down, the [`Connector`] supplies a replacement, and
/// only the interrupted operation is retried. Completed operations are never
/// repeated.
pub struct Link<C: Connector> {
    connector: C,
    heartbeat: HeartbeatConfig,
    protocol: ProtocolConfig,
    channel: Option<Arc<Channel<C::Stream>>>,
    reconnects: u32,
}

impl<C: Connector> Link<C> {
    /// Open the first connection. Waits as long as the connector does.
    pub async fn establish(
        mut connector: C,
        heartbeat: HeartbeatConfig,
        protocol: ProtocolConfig,
    ) -> Result<Self> {
        heartbeat.validate()?;
        let stream = connector.connect().await?;
        let channel = Arc::new(Channel::open(stream, &heartbeat));
        tracing::debug!(peer = %connector.peer(), "Link established");
        Ok(Self {
            connector,
            heartbeat,
            protocol,
            channel: Some(channel),
            reconnects: 0,
        })
    }

    /// Replacement connections opened so far.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// Close the connection and hand back the connector.
    pub fn close(mut self) -> C {
        self.channel = None;
        self.connector
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.channel = None;
        if self.reconnects >= self.heartbeat.max_reconnects {
            return Err(BuildfarmError::Connection(format!(
                "giving up on {} after {} reconnects",
                self.connector.peer(),
                self.reconnects
            )));
        }
        self.reconnects += 1;

        let timeout = self.heartbeat.reconnect_timeout();
        let stream = tokio::time::timeout(timeout, self.connector.connect())
            .await
            .map_err(|_| {
                BuildfarmError::Connection(format!(
                    "reconnect to {} timed out after {}ms",
                    self.connector.peer(),
                    timeout.as_millis()
                ))
            })??;

        self.channel = Some(Arc::new(Channel::open(stream, &self.heartbeat)));
        tracing::info!(
            peer = %self.connector.peer(),
            reconnects = self.reconnects,
            "Link reconnected"
        );
        Ok(())
    }

    async fn current_channel(&mut self) -> Result<Arc<Channel<C::Stream>>> {
        match &self.channel {
            Some(channel) if !channel.hung.is_cancelled() => Ok(channel.clone()),
            _ => {
                self.reconnect().await?;
                self.channel
                    .clone()
                    .ok_or_else(|| BuildfarmError::Connection("no connection".to_string()))
            }
        }
    }

    async fn run_op<T, F, Fut>(&mut self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut(Arc<Channel<C::Stream>>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let channel = self.current_channel().await?;
            let hung = channel.hung.clone();
            let result = tokio::select! {
                result = op(channel) => result,
                _ = hung.cancelled() => Err(BuildfarmError::Connection(format!(
                    "no traffic for {}ms",
                    self.heartbeat.watchdog_timeout_ms
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_connection_fault() => {
                    tracing::warn!(operation, error = %e, "Link fault, reconnecting");
                    self.channel = None;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn send_string(&mut self, message: &str) -> Result<()> {
        self.run_op("send_string", move |channel| async move {
            let mut writer = channel.writer.lock().await;
            codec::send_string(&mut *writer, message).await
        })
        .await
    }

    pub async fn send_record<T: Serialize + Sync>(&mut self, record: &T) -> Result<()> {
        self.run_op("send_record", move |channel| async move {
            let mut writer = channel.writer.lock().await;
            codec::send_record(&mut *writer, record).await
        })
        .await
    }

    pub async fn send_error(&mut self, message: &str) -> Result<()> {
        self.run_op("send_error", move |channel| async move {
            let mut writer = channel.writer.lock().await;
            codec::send_error(&mut *writer, message).await
        })
        .await
    }

    pub async fn receive_string(&mut self) -> Result<String> {
        let limit = self.protocol.max_message_size;
        let body = self
            .run_op("receive_string", move |channel| async move {
                let mut reader = channel.reader.lock().await;
                codec::receive_ignoring_heartbeat(&mut *reader, MessageType::String, limit).await
            })
            .await?;
        codec::decode_string(body)
    }

    pub async fn receive_record<T: DeserializeOwned>(&mut self) -> Result<T> {
        let limit = self.protocol.max_message_size;
        let body = self
            .run_op("receive_record", move |channel| async move {
                let mut reader = channel.reader.lock().await;
                codec::receive_ignoring_heartbeat(&mut *reader, MessageType::Record, limit).await
            })
            .await?;
        codec::decode_record(&body)
    }

    pub async fn send_file(&mut self, path: &Path) -> Result<u64> {
        let chunk_size = self.protocol.chunk_size;
        self.run_op("send_file", move |channel| async move {
            let mut writer = channel.writer.lock().await;
            file::send_file(&mut *writer, path, chunk_size).await
        })
        .await
    }

    /// Receive a file into `path`. A retry truncates whatever an interrupted
    /// attempt wrote, and a failed receive leaves no file behind.
    pub async fn receive_file(&mut self, path: &Path) -> Result<u64> {
        let chunk_size = self.protocol.chunk_size;
        let result = self
            .run_op("receive_file", move |channel| async move {
                let mut reader = channel.reader.lock().await;
                file::receive_file(&mut *reader, path, chunk_size).await
            })
            .await;
        if result.is_err() && tokio::fs::try_exists(path).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to discard partial file");
            }
        }
        result
    }
}
