//! TCP transport for network controllers.
//!
//! The stream is split so that a background task can forward inbound
//! chunks while writes proceed on the other half.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::DEFAULT_CONNECT_TIMEOUT;
use crate::error::Error;
use crate::transport::{Endpoint, Inbound, Transport, TransportFuture};

/// Size of the inbound read buffer.
const READ_BUFFER_SIZE: usize = 1024;

/// Configuration for the TCP transport.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Host name or IP address.
    pub host: String,
    /// Command port.
    pub port: u16,
    /// Connect timeout.
    pub connect_timeout: Duration,
}

impl NetConfig {
    /// Creates a configuration with the default connect timeout.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Persistent TCP connection to one controller.
pub struct NetTransport {
    config: NetConfig,
    writer: Option<OwnedWriteHalf>,
    reader: Option<OwnedReadHalf>,
    read_task: Option<JoinHandle<()>>,
}

impl NetTransport {
    /// Creates an unconnected transport.
    #[must_use]
    pub fn new(config: NetConfig) -> Self {
        Self {
            config,
            writer: None,
            reader: None,
            read_task: None,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn map_connect_error(&self, error: io::Error) -> Error {
        match error.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable => Error::TransportNotFound {
                address: self.address(),
            },
            _ => Error::Io(error),
        }
    }

    async fn run_read_loop(mut reader: OwnedReadHalf, tx: mpsc::Sender<Inbound>) {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("tcp stream closed by peer");
                    break;
                }
                Ok(n) => {
                    tracing::trace!("received {} bytes", n);
                    if tx
                        .send(Inbound::Packet(Bytes::copy_from_slice(&buf[..n])))
                        .await
                        .is_err()
                    {
                        // Subscriber gone, nothing left to report to
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("tcp read error: {}", e);
                    break;
                }
            }
        }
        let _ = tx.send(Inbound::Closed).await;
    }
}

impl Transport for NetTransport {
    fn connect(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.writer.is_some() {
                return Ok(());
            }

            let address = self.address();
            tracing::debug!("connecting to {}", address);

            let stream = tokio::time::timeout(
                self.config.connect_timeout,
                TcpStream::connect((self.config.host.as_str(), self.config.port)),
            )
            .await
            .map_err(|_| Error::Timeout {
                timeout_ms: self.config.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| self.map_connect_error(e))?;

            if let Err(e) = stream.set_nodelay(true) {
                tracing::warn!("failed to set TCP_NODELAY: {}", e);
            }

            let (reader, writer) = stream.into_split();
            self.reader = Some(reader);
            self.writer = Some(writer);

            tracing::debug!("connected to {}", address);
            Ok(())
        })
    }

    fn disconnect(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if let Some(task) = self.read_task.take() {
                task.abort();
            }
            self.reader = None;
            if let Some(mut writer) = self.writer.take() {
                tracing::debug!("disconnecting from {}", self.address());
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("tcp shutdown failed: {}", e);
                }
            }
            Ok(())
        })
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        if self.writer.is_some() {
            vec![Endpoint::Port(self.config.port)]
        } else {
            Vec::new()
        }
    }

    fn write(&mut self, endpoint: Endpoint, data: Bytes) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if endpoint != Endpoint::Port(self.config.port) {
                return Err(Error::CharacteristicMissing {
                    uuid: endpoint.to_string(),
                });
            }
            let writer = self.writer.as_mut().ok_or(Error::NotConnected)?;
            tracing::trace!("sending {} bytes", data.len());
            writer.write_all(&data).await?;
            writer.flush().await?;
            Ok(())
        })
    }

    fn read(&mut self, endpoint: Endpoint) -> TransportFuture<'_, Bytes> {
        Box::pin(async move {
            Err(Error::transport(format!(
                "{endpoint} is a stream and cannot be read directly"
            )))
        })
    }

    fn subscribe(
        &mut self,
        endpoint: Endpoint,
        sender: mpsc::Sender<Inbound>,
    ) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if endpoint != Endpoint::Port(self.config.port) {
                return Err(Error::CharacteristicMissing {
                    uuid: endpoint.to_string(),
                });
            }
            let reader = self.reader.take().ok_or(Error::NotConnected)?;
            self.read_task = Some(tokio::spawn(Self::run_read_loop(reader, sender)));
            Ok(())
        })
    }

    fn clear_cache(&mut self) {}

    fn is_connected(&self) -> bool {
        self.writer.is_some()
    }
}

impl Drop for NetTransport {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
