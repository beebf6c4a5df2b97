//! Device identity and addressing.

use std::fmt;
use std::str::FromStr;

/// Length of a hardware address in bytes.
pub const MAC_ADDRESS_LEN: usize = 6;

/// How a device is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Bluetooth Low Energy GATT.
    Ble,
    /// UDP discovery plus TCP commands.
    Net,
    /// Encrypted Telink BLE mesh.
    Mesh,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ble => "BLE",
            Self::Net => "NET",
            Self::Mesh => "ZNG",
        })
    }
}

/// A 6-byte hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress([u8; MAC_ADDRESS_LEN]);

impl MacAddress {
    /// Creates an address from raw bytes in display order.
    #[must_use]
    pub const fn new(bytes: [u8; MAC_ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Tries to create an address from a slice.
    #[must_use]
    pub fn try_from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; MAC_ADDRESS_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Returns the address bytes in display order.
    #[must_use]
    pub const fn octets(&self) -> [u8; MAC_ADDRESS_LEN] {
        self.0
    }

    /// Returns the address bytes least significant first, as used on air.
    #[must_use]
    pub fn reversed(&self) -> [u8; MAC_ADDRESS_LEN] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl FromStr for MacAddress {
    type Err = hex::FromHexError;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff` or `aabbccddeeff`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes = hex::decode(digits)?;
        Self::try_from_bytes(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

/// Identity of a device, fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Transport used to reach the device.
    pub transport: TransportKind,
    /// BLE address or network host.
    pub address: String,
    /// Advertised or user supplied name.
    pub name: Option<String>,
    /// Model name hint from discovery or saved configuration.
    pub model: Option<String>,
}

impl DeviceIdentity {
    /// Creates an identity for a BLE device.
    #[must_use]
    pub fn ble(address: impl Into<String>) -> Self {
        Self::new(TransportKind::Ble, address)
    }

    /// Creates an identity for a network device.
    #[must_use]
    pub fn net(host: impl Into<String>) -> Self {
        Self::new(TransportKind::Net, host)
    }

    /// Creates an identity for the mesh node used as the bridge.
    #[must_use]
    pub fn mesh(address: impl Into<String>) -> Self {
        Self::new(TransportKind::Mesh, address)
    }

    fn new(transport: TransportKind, address: impl Into<String>) -> Self {
        Self {
            transport,
            address: address.into(),
            name: None,
            model: None,
        }
    }

    /// Sets the device name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the model hint.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Name used in log lines.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    /// Last four hex digits of the address, upper case.
    #[must_use]
    pub fn short_address(&self) -> String {
        let digits: String = self
            .address
            .chars()
            .filter(char::is_ascii_hexdigit)
            .collect::<String>()
            .to_uppercase();
        digits[digits.len().saturating_sub(4)..].to_string()
    }

    /// Parses the address as a hardware address.
    pub fn mac(&self) -> Result<MacAddress, hex::FromHexError> {
        self.address.parse()
    }
}
