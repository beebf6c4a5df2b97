//! # uniled
//!
//! Async control of addressable LED controllers over BLE, Wi-Fi and BLE
//! mesh.
//!
//! A controller is identified from its advertisement or discovery reply,
//! wrapped in a [`Device`] and then driven through attributes: power,
//! brightness, colour, effects and the rest. Sessions are opened on
//! demand, retried on transient failures and closed again after an idle
//! period.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use uniled::transport::{Endpoint, MemoryTransport};
//! use uniled::{Attribute, Device, DeviceConfig, DeviceIdentity, LedHue};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), uniled::Error> {
//!     let (transport, _handle) = MemoryTransport::new([Endpoint::short(0xFFE1)]);
//!     let device = Device::new(
//!         DeviceIdentity::ble("AA:BB:CC:DD:EE:FF"),
//!         Arc::new(LedHue::sp110e()),
//!         transport,
//!         DeviceConfig::new(),
//!     );
//!
//!     device.set_state(0, Attribute::Power, true).await?;
//!     if device.update(None).await? {
//!         println!("{:?}", device.channel_state(0));
//!     }
//!     device.stop().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`] - Byte transports (BLE, TCP, in-memory) and discovery
//! - [`protocol`] - Frame envelopes and inbound reassembly
//! - [`mesh`] - Mesh pairing and packet encryption
//! - [`model`] - Per-family descriptors and identification
//! - [`session`] - Connection lifecycle, retries and idle teardown
//! - [`channel`] - Cached channel status and change callbacks
//! - [`event`] - Async event system
//! - [`device`] - High-level [`Device`] facade

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod mesh;
pub mod model;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use channel::{CallbackId, ChannelState, Status};
pub use config::DeviceConfig;
pub use device::Device;
pub use error::{Error, FrameError, Result};
pub use event::{Event, EventDispatcher, EventFilter, EventKind, Subscription};
pub use mesh::MeshCredentials;
pub use model::{
    Advertisement, BanlanX, BanlanX2, LedChord, LedHue, MatchResult, ModelDescriptor, Registry,
    SpTech, Zengge,
};
pub use retry::{Classification, RetryPolicy};
pub use session::{SessionManager, SessionState, StatusSink};
pub use transport::{Endpoint, Transport};
pub use types::{Attribute, DeviceIdentity, MacAddress, TransportKind, Value};
