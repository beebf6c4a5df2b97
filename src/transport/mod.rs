//! Transport layer for controller communication.
//!
//! A transport moves raw bytes to and from named endpoints: GATT
//! characteristics for BLE and mesh devices, a TCP port for network
//! devices. Framing, encryption and retries live above this layer.

#[cfg(feature = "ble")]
pub mod ble;
pub mod discovery;
pub mod memory;
pub mod net;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// An addressable data endpoint on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A GATT characteristic.
    Characteristic(Uuid),
    /// A TCP port.
    Port(u16),
}

/// Expands a 16-bit Bluetooth SIG short id into a full UUID.
#[must_use]
pub const fn short_uuid(id: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((id as u128) << 96))
}

impl Endpoint {
    /// Creates a characteristic endpoint from a 16-bit Bluetooth SIG short id.
    #[must_use]
    pub const fn short(id: u16) -> Self {
        Self::Characteristic(short_uuid(id))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Characteristic(uuid) => write!(f, "{uuid}"),
            Self::Port(port) => write!(f, "port {port}"),
        }
    }
}

/// Traffic delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// One notification packet or stream chunk.
    Packet(Bytes),
    /// The link dropped without being asked to.
    Closed,
}

/// Trait for transport implementations.
pub trait Transport: Send + Sync {
    /// Connects to the device.
    fn connect(&mut self) -> TransportFuture<'_, ()>;

    /// Disconnects from the device.
    fn disconnect(&mut self) -> TransportFuture<'_, ()>;

    /// Endpoints the connected device offers.
    fn endpoints(&self) -> Vec<Endpoint>;

    /// Writes data to an endpoint.
    fn write(&mut self, endpoint: Endpoint, data: Bytes) -> TransportFuture<'_, ()>;

    /// Reads the current value of an endpoint.
    fn read(&mut self, endpoint: Endpoint) -> TransportFuture<'_, Bytes>;

    /// Forwards traffic from an endpoint to `sender` until disconnected.
    fn subscribe(
        &mut self,
        endpoint: Endpoint,
        sender: mpsc::Sender<Inbound>,
    ) -> TransportFuture<'_, ()>;

    /// Drops any cached service discovery.
    fn clear_cache(&mut self);

    /// Returns true if connected.
    fn is_connected(&self) -> bool;
}

pub use discovery::{Discovery, DiscoveryConfig, Scanner};
pub use memory::{MemoryHandle, MemoryTransport, Reply};
pub use net::{NetConfig, NetTransport};

#[cfg(feature = "ble")]
pub use ble::{BleScanner, BleTransport};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid() {
        let Endpoint::Characteristic(uuid) = Endpoint::short(0xFFE1) else {
            panic!("expected characteristic");
        };
        assert_eq!(uuid.to_string(), "0000ffe1-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::Port(8587).to_string(), "port 8587");
    }
}
