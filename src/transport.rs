//! Transport to the first hop
//!
//! A [`Transport`] opens byte streams; a [`Channel`] is one open stream,
//! owned by exactly one circuit. Framing is the cell codec's job, so a
//! channel only moves bytes in order.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{CircuitError, Result};

/// Opens channels; shared between concurrently building circuits
#[async_trait]
pub trait Transport: Send + Sync {
    type Channel: Channel;

    /// Connect to `host:port`
    async fn connect(&self, host: &str, port: u16) -> Result<Self::Channel>;
}

/// One ordered, reliable byte stream
#[async_trait]
pub trait Channel: Send {
    /// Write all of `bytes`
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read some bytes into `buf`; `Ok(0)` means the peer closed
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Shut the stream down
    async fn close(&mut self) -> Result<()>;
}

/// Plain TCP via tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Channel = TcpChannel;

    async fn connect(&self, host: &str, port: u16) -> Result<TcpChannel> {
        log::debug!("Connecting to {}:{}", host, port);
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| CircuitError::Transport(format!("connect {}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true)?;
        Ok(TcpChannel { stream })
    }
}

/// A TCP connection to a relay's OR port
#[derive(Debug)]
pub struct TcpChannel {
    stream: TcpStream,
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream.read(buf).await?)
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
