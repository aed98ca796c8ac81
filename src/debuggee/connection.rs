//! Connecting to the runtime's debug server
//!
//! The runtime opens its debug port some time after the process starts, so
//! connecting is a retry loop. Retries stop for good when the process dies,
//! when the session shuts down, or when the optional attempt cap is reached.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::config::RelayConfig;
use crate::{Error, Result};

/// Opens a duplex byte stream to the debug server
pub trait Connect: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn connect(&self, host: &str, port: u16) -> impl Future<Output = std::io::Result<Self::Stream>> + Send;
}

/// Plain TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connect for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, host: &str, port: u16) -> impl Future<Output = std::io::Result<TcpStream>> + Send {
        let addr = format!("{}:{}", host, port);
        async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
    }
}

/// Reconnect policy: fixed interval, optional cap, no backoff growth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl From<&RelayConfig> for RetryPolicy {
    fn from(config: &RelayConfig) -> Self {
        Self {
            attempt_timeout: config.connect_timeout(),
            interval: config.retry_interval(),
            max_attempts: config.max_connect_attempts,
        }
    }
}

/// Establishes the transport to the remote debugger
pub struct ConnectionManager<C: Connect = TcpConnector> {
    connector: C,
    policy: RetryPolicy,
}

impl<C: Connect> ConnectionManager<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self { connector, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// One connection attempt bounded by `timeout`
    pub async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<C::Stream> {
        let addr = format!("{}:{}", host, port);
        match tokio::time::timeout(timeout, self.connector.connect(host, port)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::Connect {
                addr,
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Connect {
                addr,
                reason: format!("timed out after {:?}", timeout),
            }),
        }
    }

    /// Keep connecting until it works.
    ///
    /// `is_alive` is asked after every failure and again when the retry timer
    /// fires; once it says no, no further attempt is made. A `true` on
    /// `shutdown` abandons the loop immediately, even mid-wait.
    pub async fn connect_with_retry<F>(
        &self,
        host: &str,
        port: u16,
        is_alive: F,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<C::Stream>
    where
        F: Fn() -> bool,
    {
        let mut attempts = 0u32;
        loop {
            if *shutdown.borrow() {
                return Err(Error::ShutDown);
            }

            attempts += 1;
            tracing::debug!("Connecting to {}:{} (attempt {})", host, port, attempts);

            let attempt = tokio::select! {
                result = self.connect(host, port, self.policy.attempt_timeout) => result,
                _ = stopped(&mut shutdown) => return Err(Error::ShutDown),
            };

            match attempt {
                Ok(stream) => {
                    tracing::info!("Connected to debug server at {}:{} after {} attempt(s)", host, port, attempts);
                    return Ok(stream);
                }
                Err(e) if e.is_connect_failure() => {
                    tracing::debug!("{}", e);
                }
                Err(e) => return Err(e),
            }

            if !is_alive() {
                tracing::info!("Runtime exited, not retrying connection");
                return Err(Error::ChildExited);
            }
            if let Some(max) = self.policy.max_attempts {
                if attempts >= max {
                    tracing::warn!("Giving up on debug server after {} attempts", attempts);
                    return Err(Error::AttemptsExhausted(attempts));
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.policy.interval) => {}
                _ = stopped(&mut shutdown) => return Err(Error::ShutDown),
            }

            if !is_alive() {
                tracing::info!("Runtime exited while waiting to retry");
                return Err(Error::ChildExited);
            }
        }
    }
}

/// Resolves once the shutdown flag is raised
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            // Sender gone without ever signalling: never resolves
            std::future::pending::<()>().await;
        }
    }
}
