//! UDP discovery of network controllers.
//!
//! The scanner broadcasts a fixed request to port 6454 and collects the
//! replies. A reply carries a fixed preamble, then:
//! ```text
//! ┌─────┬────────────┬─────┬──────┬──────────┬─────────────────┐
//! │ ... │ model code │ ... │ MAC  │ name len │ name (NUL term) │
//! │ 0-2 │     3      │  4  │ 5-10 │    11    │ 12 ..           │
//! └─────┴────────────┴─────┴──────┴──────────┴─────────────────┘
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::error::Result;
use crate::types::MacAddress;

/// Discovery port.
pub const DISCOVERY_PORT: u16 = 6454;

/// Request broadcast by the scanner.
pub const DISCOVERY_MESSAGE: [u8; 14] = [
    0x53, 0x70, 0x4e, 0x65, 0x74, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x02, 0xe0,
];

/// Preamble of every device reply.
pub const DISCOVERY_RESPONSE: [u8; 14] = [
    0x53, 0x70, 0x4e, 0x65, 0x74, 0x00, 0x00, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
];

/// Replies are read with this cap.
pub const MAX_RESPONSE_SIZE: usize = 40;

/// Default scan duration.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of receive windows per scan.
pub const DEFAULT_BROADCAST_FREQUENCY: u32 = 8;

/// Default pause after each request.
pub const DEFAULT_INTERLEAVE_DELAY: Duration = Duration::from_millis(400);

/// A controller that answered a discovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    /// Source address of the reply.
    pub host: IpAddr,
    /// Model code.
    pub code: u8,
    /// Hardware address.
    pub mac: Option<MacAddress>,
    /// Device name, if one is set.
    pub name: Option<String>,
}

impl Discovery {
    /// Parses a reply. Returns `None` for foreign traffic and echoed requests.
    #[must_use]
    pub fn parse(host: IpAddr, data: &[u8]) -> Option<Self> {
        if data == DISCOVERY_MESSAGE {
            return None;
        }
        let body = data.strip_prefix(&DISCOVERY_RESPONSE[..])?;
        let code = *body.get(3)?;
        let mac = body.get(5..11).and_then(MacAddress::try_from_bytes);
        let name = match body.get(11) {
            Some(&len) if len > 0 => {
                let end = (12 + usize::from(len) - 1).min(body.len());
                body.get(12..end)
                    .map(|raw| String::from_utf8_lossy(raw).into_owned())
            }
            _ => None,
        };
        Some(Self {
            host,
            code,
            mac,
            name,
        })
    }
}

/// Configuration for a discovery scan.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Total scan duration.
    pub timeout: Duration,
    /// Number of receive windows the timeout is split into.
    pub frequency: u32,
    /// Pause after each request.
    pub interleave: Duration,
    /// Port requests are sent to.
    pub port: u16,
}

impl DiscoveryConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeout: DEFAULT_SCAN_TIMEOUT,
            frequency: DEFAULT_BROADCAST_FREQUENCY,
            interleave: DEFAULT_INTERLEAVE_DELAY,
            port: DISCOVERY_PORT,
        }
    }

    /// Sets the scan duration.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the number of receive windows.
    #[must_use]
    pub fn frequency(mut self, frequency: u32) -> Self {
        self.frequency = frequency.max(1);
        self
    }

    /// Sets the pause after each request.
    #[must_use]
    pub const fn interleave(mut self, delay: Duration) -> Self {
        self.interleave = delay;
        self
    }

    /// Sets the destination port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// UDP discovery scanner.
#[derive(Debug, Clone, Default)]
pub struct Scanner {
    config: DiscoveryConfig,
}

impl Scanner {
    /// Creates a scanner.
    #[must_use]
    pub const fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Broadcasts requests for the configured duration.
    pub async fn scan(&self) -> Result<Vec<Discovery>> {
        let destination = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.config.port);
        self.run(destination, None).await
    }

    /// Queries a single host, returning as soon as it answers.
    pub async fn scan_host(&self, host: IpAddr) -> Result<Option<Discovery>> {
        let destination = SocketAddr::new(host, self.config.port);
        let found = self.run(destination, Some(host)).await?;
        Ok(found.into_iter().find(|d| d.host == host))
    }

    async fn bind(&self) -> Result<UdpSocket> {
        // Older firmware only answers requests sourced from the discovery port
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT)).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::debug!("port {} is not available: {}", DISCOVERY_PORT, e);
                UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?
            }
        };
        socket.set_broadcast(true)?;
        Ok(socket)
    }

    async fn send_request(&self, socket: &UdpSocket, destination: SocketAddr) -> Result<()> {
        tracing::debug!(
            "send UDP: {} => {}",
            destination,
            hex::encode(DISCOVERY_MESSAGE)
        );
        socket.send_to(&DISCOVERY_MESSAGE, destination).await?;
        tokio::time::sleep(self.config.interleave).await;
        Ok(())
    }

    async fn run(&self, destination: SocketAddr, target: Option<IpAddr>) -> Result<Vec<Discovery>> {
        let socket = self.bind().await?;
        let quit = Instant::now() + self.config.timeout;
        let window = self.config.timeout / self.config.frequency.max(1);
        let mut found: Vec<Discovery> = Vec::new();
        let mut buf = [0u8; MAX_RESPONSE_SIZE];

        self.send_request(&socket, destination).await?;
        loop {
            let remaining = quit.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let wait = remaining.min(window);
            let (len, from) =
                match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
                    Ok(received) => received?,
                    Err(_) => {
                        if Instant::now() < quit {
                            // Nothing heard, the request may have been lost
                            self.send_request(&socket, destination).await?;
                        }
                        continue;
                    }
                };

            let data = &buf[..len];
            let Some(discovery) = Discovery::parse(from.ip(), data) else {
                continue;
            };
            tracing::debug!("response: {} <= {} ({})", from, hex::encode(data), len);

            if found.iter().any(|d| d.host == discovery.host) {
                continue;
            }
            tracing::debug!(
                "discovered '{}' ({}) code {:#04x}",
                discovery.host,
                discovery.name.as_deref().unwrap_or("unnamed"),
                discovery.code
            );
            let hit = target == Some(discovery.host);
            found.push(discovery);
            if hit {
                break;
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(code: u8, name: &str) -> Vec<u8> {
        let mut data = DISCOVERY_RESPONSE.to_vec();
        data.extend_from_slice(&[0x00, 0x00, 0x00, code, 0x00]);
        data.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        data.push(name.len() as u8 + 1);
        data.extend_from_slice(name.as_bytes());
        data.push(0x00);
        data
    }

    #[test]
    fn test_parse_reply() {
        let host: IpAddr = "192.168.1.40".parse().unwrap();
        let discovery = Discovery::parse(host, &reply(0x4E, "SP530E")).unwrap();
        assert_eq!(discovery.code, 0x4E);
        assert_eq!(discovery.name.as_deref(), Some("SP530E"));
        assert_eq!(
            discovery.mac.unwrap().to_string(),
            "AA:BB:CC:01:02:03"
        );
    }

    #[test]
    fn test_parse_rejects_echo_and_foreign() {
        let host: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(Discovery::parse(host, &DISCOVERY_MESSAGE), None);
        assert_eq!(Discovery::parse(host, b"hello"), None);
        assert_eq!(Discovery::parse(host, &DISCOVERY_RESPONSE), None);
    }

    #[test]
    fn test_parse_without_name() {
        let host: IpAddr = "10.0.0.1".parse().unwrap();
        let mut data = reply(0x4E, "");
        data[DISCOVERY_RESPONSE.len() + 11] = 0;
        let discovery = Discovery::parse(host, &data).unwrap();
        assert_eq!(discovery.name, None);
    }

    #[tokio::test]
    async fn test_scan_host_returns_early() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = device.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = device.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], &DISCOVERY_MESSAGE);
            device.send_to(&reply(0x4E, "Porch"), from).await.unwrap();
        });

        let scanner = Scanner::new(
            DiscoveryConfig::new()
                .port(port)
                .timeout(Duration::from_secs(5))
                .interleave(Duration::from_millis(10)),
        );
        let started = std::time::Instant::now();
        let found = scanner
            .scan_host("127.0.0.1".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name.as_deref(), Some("Porch"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
