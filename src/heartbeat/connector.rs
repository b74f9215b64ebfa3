use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{BuildfarmError, Result};

/// Produces connections for a [`Link`](crate::heartbeat::Link), both the
/// first one and every replacement after a fault.
#[async_trait]
pub trait Connector: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&mut self) -> Result<Self::Stream>;

    /// Human readable peer description for logs.
    fn peer(&self) -> String;
}

/// Builder side: every connection is the next one accepted on the listener.
#[derive(Debug, Clone)]
pub struct Acceptor {
    listener: Arc<TcpListener>,
}

impl Acceptor {
    pub fn new(listener: Arc<TcpListener>) -> Self {
        Self { listener }
    }
}

#[async_trait]
impl Connector for Acceptor {
    type Stream = TcpStream;

    async fn connect(&mut self) -> Result<TcpStream> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::info!(peer = %addr, "Accepted connection");
        Ok(stream)
    }

    fn peer(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => format!("clients of {}", addr),
            Err(_) => "clients".to_string(),
        }
    }
}

/// Client side: resolve and dial `host:port`, retrying a bounded number of
/// times.
#[derive(Debug, Clone)]
pub struct Resolver {
    addr: String,
    attempts: u32,
    retry_delay: Duration,
}

impl Resolver {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            attempts: 5,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_retries(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }
}

#[async_trait]
impl Connector for Resolver {
    type Stream = TcpStream;

    async fn connect(&mut self) -> Result<TcpStream> {
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    tracing::debug!(addr = %self.addr, attempt, "Connected");
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::warn!(addr = %self.addr, attempt, error = %e, "Connect failed");
                    last_error = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(BuildfarmError::Connection(format!(
            "could not reach {} after {} attempts: {}",
            self.addr,
            self.attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string())
        )))
    }

    fn peer(&self) -> String {
        self.addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolver_reaches_acceptor() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();
        let mut acceptor = Acceptor::new(listener);
        let mut resolver = Resolver::new(addr.to_string());

        let (accepted, dialed) = tokio::join!(acceptor.connect(), resolver.connect());
        assert!(accepted.is_ok());
        assert_eq!(dialed.unwrap().peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn resolver_gives_up_after_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut resolver =
            Resolver::new(addr.to_string()).with_retries(2, Duration::from_millis(10));
        assert!(matches!(
            resolver.connect().await,
            Err(BuildfarmError::Connection(_))
        ));
    }
}
