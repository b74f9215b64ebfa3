use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::broker::{BrokerHandle, ReservationHandle};
use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{CHECKOUT_COMPLETE, CHECKOUT_REQUEST, STATUS_REQUEST};
use crate::protocol::Messenger;

/// Accepts client connections and serves checkout and status requests.
pub struct QueueServer {
    listener: TcpListener,
    broker: BrokerHandle,
    protocol: ProtocolConfig,
}

impl QueueServer {
    pub async fn bind(
        addr: SocketAddr,
        broker: BrokerHandle,
        protocol: ProtocolConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            broker,
            protocol,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` is cancelled. Each connection runs on its own
    /// task; an accept failure ends the loop so the caller can restart it.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "Queue server listening");

        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = shutdown.cancelled() => {
                    tracing::info!("Queue server shutting down");
                    return Ok(());
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let broker = self.broker.clone();
            let protocol = self.protocol.clone();
            let span = tracing::info_span!("queue_session", peer = %peer);
            tokio::spawn(
                async move {
                    if let Err(e) = serve_connection(stream, broker, protocol).await {
                        tracing::warn!(error = %e, "Queue session failed");
                    }
                }
                .instrument(span),
            );
        }
    }
}

/// Serve the single request a client connection carries.
pub async fn serve_connection<S>(
    stream: S,
    broker: BrokerHandle,
    protocol: ProtocolConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut messenger = Messenger::new(stream, protocol);
    let request = messenger.receive_string().await?;
    tracing::debug!(request = %request, "Request received");

    match request.as_str() {
        CHECKOUT_REQUEST => checkout(&mut messenger, &broker).await,
        STATUS_REQUEST => {
            let status = broker.status().await?;
            messenger.send_record(&status).await
        }
        other => {
            let reason = format!("unknown request '{}'", other);
            messenger.send_error(&reason).await?;
            Err(ProtocolError::Malformed(reason).into())
        }
    }
}

async fn checkout<S>(messenger: &mut Messenger<S>, broker: &BrokerHandle) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reservation = broker.reserve()?;
    tracing::info!(reservation_id = %reservation.id(), "Client queued for a builder");

    let resource = tokio::select! {
        ready = reservation.wait_ready() => ready?,
        early = messenger.receive_string() => {
            return left_while_queued(&reservation, early);
        }
    };

    tracing::info!(
        reservation_id = %reservation.id(),
        resource = %resource,
        "Builder checked out"
    );
    messenger.send_record(&resource).await?;

    match messenger.receive_string().await {
        Ok(message) if message == CHECKOUT_COMPLETE => {
            tracing::info!(reservation_id = %reservation.id(), "Checkout complete");
        }
        Ok(other) => {
            tracing::warn!(
                reservation_id = %reservation.id(),
                message = %other,
                "Unexpected message during checkout, releasing builder"
            );
        }
        Err(e) => {
            tracing::info!(
                reservation_id = %reservation.id(),
                error = %e,
                "Client disconnected, releasing builder"
            );
        }
    }
    reservation.release();
    Ok(())
}

fn left_while_queued(reservation: &ReservationHandle, early: Result<String>) -> Result<()> {
    match early {
        Ok(message) if message == CHECKOUT_COMPLETE => {
            tracing::info!(reservation_id = %reservation.id(), "Client withdrew from queue");
            Ok(())
        }
        Ok(other) => Err(ProtocolError::Malformed(format!(
            "unexpected '{}' while waiting for a builder",
            other
        ))
        .into()),
        Err(e) => {
            tracing::info!(
                reservation_id = %reservation.id(),
                error = %e,
                "Client disconnected while queued"
            );
            Ok(())
        }
    }
}
