use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::codec::{self, Header, HEADER_LEN};
use crate::protocol::file::CHECKSUM_LEN;
use crate::protocol::MessageType;

/// Buffered inbound bytes between the pump and the link's readers.
pub const PIPE_CAPACITY: usize = 256 * 1024;

/// Wraps a stream and bumps a counter whenever bytes arrive, so the
/// watchdog can observe the peer without touching the reader.
///
/// Writes are never counted: a side's own traffic does not prove that its
/// peer is alive.
pub struct Metered<S> {
    inner: S,
    activity: watch::Sender<u64>,
}

impl<S> Metered<S> {
    pub fn new(inner: S) -> (Self, watch::Receiver<u64>) {
        let (activity, observed) = watch::channel(0);
        (Self { inner, activity }, observed)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Metered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.activity
                .send_modify(|count| *count = count.wrapping_add(1));
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Metered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Read frames off `socket` for as long as the connection lives, dropping
/// heartbeats and forwarding everything else into `pipe`.
///
/// The socket is drained even while no operation is reading, so the peer's
/// pulses keep reaching the watchdog during a long quiet stretch. When the
/// socket fails the pipe is closed and the next read sees end of stream.
pub fn spawn_pump<R>(mut socket: R, mut pipe: DuplexStream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = pump(&mut socket, &mut pipe).await {
            tracing::debug!(error = %e, "Inbound pump stopped");
        }
    })
}

async fn pump<R>(socket: &mut R, pipe: &mut DuplexStream) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    loop {
        socket.read_exact(&mut raw).await?;
        let body_len = match Header::decode(&raw) {
            Ok(header) if header.kind == MessageType::Heartbeat && header.length == 0 => {
                tracing::trace!("Heartbeat received");
                continue;
            }
            Ok(header) if header.kind == MessageType::File => {
                header.length.saturating_add(CHECKSUM_LEN as u64)
            }
            Ok(header) => header.length,
            Err(_) => {
                // The reader reports the bad header; nothing after it is framed.
                pipe.write_all(&raw).await?;
                return Ok(());
            }
        };

        pipe.write_all(&raw).await?;
        let copied = tokio::io::copy(&mut (&mut *socket).take(body_len), pipe).await?;
        if copied < body_len {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
}

/// Cancel `hung` once `timeout` passes without inbound traffic.
pub fn spawn_watchdog(
    mut activity: watch::Receiver<u64>,
    timeout: Duration,
    hung: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = activity.changed() => {
                    if changed.is_err() {
                        // Connection dropped.
                        return;
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    tracing::warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "Watchdog expired, connection is hung"
                    );
                    hung.cancel();
                    return;
                }
                _ = hung.cancelled() => return,
            }
        }
    })
}

/// Send a heartbeat every `interval` until `hung` is cancelled. A failed
/// write trips `hung` so the owning link reconnects.
pub fn spawn_pulse<W>(
    writer: Arc<Mutex<W>>,
    interval: Duration,
    hung: CancellationToken,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = hung.cancelled() => return,
            }

            let mut writer = tokio::select! {
                guard = writer.lock() => guard,
                _ = hung.cancelled() => return,
            };
            let sent = tokio::select! {
                sent = codec::send_heartbeat(&mut *writer) => sent,
                _ = hung.cancelled() => return,
            };
            if let Err(e) = sent {
                tracing::debug!(error = %e, "Heartbeat write failed");
                hung.cancel();
                return;
            }
            tracing::trace!("Heartbeat sent");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metered_counts_reads_only() {
        let (a, mut b) = tokio::io::duplex(64);
        let (mut metered, observed) = Metered::new(a);

        metered.write_all(b"ping").await.unwrap();
        assert_eq!(*observed.borrow(), 0);

        b.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        metered.read_exact(&mut buf).await.unwrap();
        assert!(*observed.borrow() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_fires_after_silence() {
        let (_tx, rx) = watch::channel(0u64);
        let hung = CancellationToken::new();
        let task = spawn_watchdog(rx, Duration::from_secs(10), hung.clone());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!hung.is_cancelled());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(hung.is_cancelled());
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_rearms_watchdog() {
        let (tx, rx) = watch::channel(0u64);
        let hung = CancellationToken::new();
        let _task = spawn_watchdog(rx, Duration::from_secs(10), hung.clone());

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            tx.send_modify(|n| *n += 1);
        }
        assert!(!hung.is_cancelled());
    }

    #[tokio::test]
    async fn pump_drops_heartbeats_and_forwards_frames() {
        let (mut peer, socket) = tokio::io::duplex(1024);
        let (pipe_in, mut pipe_out) = tokio::io::duplex(1024);
        let task = spawn_pump(socket, pipe_in);

        codec::send_heartbeat(&mut peer).await.unwrap();
        codec::send_string(&mut peer, "hello").await.unwrap();
        codec::send_heartbeat(&mut peer).await.unwrap();
        drop(peer);

        let mut forwarded = Vec::new();
        pipe_out.read_to_end(&mut forwarded).await.unwrap();
        let mut expected = Vec::new();
        codec::send_string(&mut expected, "hello").await.unwrap();
        assert_eq!(forwarded, expected);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn pump_forwards_file_trailer() {
        let (mut peer, socket) = tokio::io::duplex(4096);
        let (pipe_in, mut pipe_out) = tokio::io::duplex(4096);
        let _task = spawn_pump(socket, pipe_in);

        let mut wire = Vec::new();
        crate::protocol::file::send_file_from(&mut wire, &mut &[9u8; 1000][..], 1000, 256)
            .await
            .unwrap();
        peer.write_all(&wire).await.unwrap();
        drop(peer);

        let mut forwarded = Vec::new();
        pipe_out.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, wire);
    }

    #[tokio::test]
    async fn pump_closes_pipe_on_truncated_frame() {
        let (mut peer, socket) = tokio::io::duplex(1024);
        let (pipe_in, mut pipe_out) = tokio::io::duplex(1024);
        let task = spawn_pump(socket, pipe_in);

        let mut wire = Vec::new();
        codec::send_string(&mut wire, "truncated").await.unwrap();
        peer.write_all(&wire[..wire.len() - 3]).await.unwrap();
        drop(peer);

        let mut forwarded = Vec::new();
        pipe_out.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, &wire[..wire.len() - 3]);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_writes_heartbeat_frames() {
        let (a, mut b) = tokio::io::duplex(1024);
        let writer = Arc::new(Mutex::new(a));
        let hung = CancellationToken::new();
        let task = spawn_pulse(writer, Duration::from_secs(5), hung.clone());

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        let header = codec::read_header(&mut b).await.unwrap();
        assert_eq!(header.kind, MessageType::Heartbeat);
        assert_eq!(header.length, 0);

        hung.cancel();
        task.await.unwrap();
    }
}
