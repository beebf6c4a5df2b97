//! Data types shared across the library:
//! - Device identity and hardware addresses
//! - Channel attributes and values

pub mod attribute;
pub mod identity;

pub use attribute::{Attribute, UnknownAttribute, Value};
pub use identity::{DeviceIdentity, MacAddress, TransportKind};
