//! Wire protocol and TCP plumbing shared by the `syncd` receiver and the `syncmon` sender.
//!
//! Every connection carries exactly one message, see [`protocol`] for the envelope layout and
//! [`streams`] for the reading and writing halves.

use anyhow::Context;
use tracing::instrument;

pub mod protocol;
pub mod streams;

/// Timeouts applied to outbound connections.
#[derive(Debug, Clone, Copy)]
pub struct TcpConfig {
    /// Maximum time to establish a connection
    pub conn_timeout: std::time::Duration,
    /// Maximum time a single write may stall
    pub io_timeout: std::time::Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            conn_timeout: std::time::Duration::from_secs(15),
            io_timeout: std::time::Duration::from_secs(30),
        }
    }
}

/// Connects to `addr` (anything `host:port` resolvable), bounded by the configured timeout.
#[instrument]
pub async fn connect(addr: &str, config: &TcpConfig) -> anyhow::Result<tokio::net::TcpStream> {
    let stream = match tokio::time::timeout(
        config.conn_timeout,
        tokio::net::TcpStream::connect(addr),
    )
    .await
    {
        Ok(res) => res.with_context(|| format!("Failed to connect to {addr}"))?,
        Err(_) => anyhow::bail!(
            "Timed out connecting to {} after {:?}",
            addr,
            config.conn_timeout
        ),
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Opens a send stream on a fresh connection to `addr`.
pub async fn connect_send_stream(
    addr: &str,
    config: &TcpConfig,
) -> anyhow::Result<streams::SendStream> {
    let stream = connect(addr, config).await?;
    Ok(streams::SendStream::new(stream, config.io_timeout))
}

/// Binds the listening socket for the receiver.
#[instrument]
pub async fn bind(addr: &str) -> anyhow::Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}
