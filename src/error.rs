//! Error types for the uniled library.

use thiserror::Error;

use crate::retry::Classification;
use crate::types::Attribute;

/// The main error type for uniled operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Device is out of range or was never seen.
    #[error("device not found: {address}")]
    TransportNotFound { address: String },

    /// Link-level failure that may succeed on another attempt.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// BLE stack error.
    #[cfg(feature = "ble")]
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// A mandatory characteristic or port is not offered by the device.
    #[error("characteristic missing: {uuid}")]
    CharacteristicMissing { uuid: String },

    /// Frame reassembly error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Payload could not be interpreted by the model descriptor.
    #[error("decode error: {message}")]
    Decode { message: String },

    /// Mesh credentials were refused by the accessory.
    #[error("mesh pairing rejected, check mesh name and password")]
    PairingRejected,

    /// No status notification arrived in time.
    #[error("status query timed out after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    /// An I/O step timed out.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,

    /// Attribute is not supported by the channel.
    #[error("attribute '{attribute}' is not supported")]
    Unsupported { attribute: Attribute },

    /// Value rejected by the model descriptor before dispatch.
    #[error("invalid value for '{attribute}': {reason}")]
    InvalidValue { attribute: Attribute, reason: String },

    /// Internal channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    /// Creates a retryable transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a payload decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid(attribute: Attribute, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            attribute,
            reason: reason.into(),
        }
    }

    /// Returns how a retry loop should treat this error.
    #[must_use]
    pub fn classify(&self) -> Classification {
        match self {
            Self::TransportNotFound { .. } => Classification::NotFound,
            #[cfg(feature = "ble")]
            Self::Ble(btleplug::Error::DeviceNotFound) => Classification::NotFound,
            Self::CharacteristicMissing { .. }
            | Self::PairingRejected
            | Self::Unsupported { .. }
            | Self::InvalidValue { .. }
            | Self::ChannelClosed => Classification::Fatal,
            _ => Classification::Retryable,
        }
    }

    /// Returns true if this error must tear the session down.
    #[must_use]
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            Self::CharacteristicMissing { .. } | Self::PairingRejected
        )
    }
}

/// Frame-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Packet too short to contain its header.
    #[error("frame too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },

    /// Declared frame exceeds the maximum size.
    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// Packet sequence number did not follow the previous one.
    #[error("frame out of sequence: expected packet {expected}, got {got}")]
    OutOfSequence { expected: u8, got: u8 },

    /// Length accounting of a frame does not add up.
    #[error("frame corrupt: {reason}")]
    Corrupt { reason: String },

    /// Packet does not carry the expected preamble.
    #[error("unrecognized packet: {0}")]
    Unrecognized(String),
}

/// Result type alias for uniled operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let not_found = Error::TransportNotFound {
            address: "AA:BB:CC:DD:EE:FF".into(),
        };
        assert_eq!(not_found.classify(), Classification::NotFound);
        assert_eq!(Error::transport("gatt").classify(), Classification::Retryable);
        assert_eq!(Error::NotConnected.classify(), Classification::Retryable);
        assert_eq!(Error::PairingRejected.classify(), Classification::Fatal);
        assert_eq!(
            Error::CharacteristicMissing {
                uuid: "ffe1".into()
            }
            .classify(),
            Classification::Fatal
        );
        let frame = Error::from(FrameError::OutOfSequence {
            expected: 2,
            got: 3,
        });
        assert_eq!(frame.classify(), Classification::Retryable);
    }

    #[test]
    fn test_session_invalidation() {
        assert!(Error::PairingRejected.invalidates_session());
        assert!(!Error::QueryTimeout { timeout_ms: 2000 }.invalidates_session());
    }
}
