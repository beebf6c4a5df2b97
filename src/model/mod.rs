//! Model descriptors.
//!
//! A [`ModelDescriptor`] describes one controller family: how to recognise
//! it, which endpoints it uses, how attribute changes are encoded and how
//! status payloads are decoded. Descriptors are immutable and shared by
//! every device of the family. Encoding and decoding are pure; all I/O
//! happens in the session.

pub mod banlanx;
pub mod banlanx2;
pub mod chips;
pub mod effect;
pub mod led_chord;
pub mod led_hue;
pub mod registry;
pub mod sptech;
pub mod zengge;

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::channel::{ChannelView, Status};
use crate::error::{Error, Result};
use crate::protocol::frame::Framing;
use crate::transport::{Discovery, Endpoint};
use crate::types::{Attribute, TransportKind, Value};

pub use banlanx::BanlanX;
pub use banlanx2::BanlanX2;
pub use effect::{Effect, EffectCatalog, EffectKind};
pub use led_chord::LedChord;
pub use led_hue::LedHue;
pub use registry::{MatchResult, Registry};
pub use sptech::SpTech;
pub use zengge::Zengge;

/// Descriptor-private, per-device state held by the master channel.
pub type Context = Arc<dyn Any + Send + Sync>;

/// Characteristic a command is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The command characteristic or port.
    Write,
    /// The status characteristic, written raw.
    Notify,
}

/// One outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Where the frame goes.
    pub target: Target,
    /// Frame bytes. For mesh families these are plaintext and get sealed
    /// by the session.
    pub data: Bytes,
}

impl Command {
    /// A frame for the command characteristic.
    #[must_use]
    pub fn write(data: impl Into<Bytes>) -> Self {
        Self {
            target: Target::Write,
            data: data.into(),
        }
    }

    /// A raw frame for the status characteristic.
    #[must_use]
    pub fn notify(data: impl Into<Bytes>) -> Self {
        Self {
            target: Target::Notify,
            data: data.into(),
        }
    }
}

/// Endpoints a family uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    /// Advertised primary service, a secondary identification signal.
    pub service: Option<Uuid>,
    /// Commands are written here.
    pub write: Endpoint,
    /// Status arrives here.
    pub notify: Endpoint,
    /// Optional separately readable characteristic.
    pub read: Option<Endpoint>,
    /// Mesh pairing characteristic.
    pub pair: Option<Endpoint>,
}

impl Endpoints {
    /// Write and notify on one characteristic.
    #[must_use]
    pub const fn shared(service: Option<Uuid>, endpoint: Endpoint) -> Self {
        Self {
            service,
            write: endpoint,
            notify: endpoint,
            read: None,
            pair: None,
        }
    }

    /// Endpoints the device must offer for a session to proceed.
    #[must_use]
    pub fn mandatory(&self) -> Vec<Endpoint> {
        let mut endpoints = vec![self.write];
        if self.notify != self.write {
            endpoints.push(self.notify);
        }
        endpoints.extend(self.pair);
        endpoints
    }
}

/// Handshake needed between resolving endpoints and subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pairing {
    /// Pairing always succeeds.
    None,
    /// Telink mesh key exchange.
    Mesh,
}

/// Identification data seen before connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advertisement {
    /// BLE advertisement.
    Ble {
        /// Peripheral address.
        address: String,
        /// Local name.
        name: Option<String>,
        /// Manufacturer data by company id.
        manufacturer_data: BTreeMap<u16, Vec<u8>>,
        /// Advertised service UUIDs.
        services: Vec<Uuid>,
    },
    /// UDP discovery reply.
    Net(Discovery),
}

impl Advertisement {
    /// Advertised name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Ble { name, .. } => name.as_deref(),
            Self::Net(discovery) => discovery.name.as_deref(),
        }
    }

    /// Transport the advertisement arrived on.
    #[must_use]
    pub const fn transport(&self) -> TransportKind {
        match self {
            Self::Ble { .. } => TransportKind::Ble,
            Self::Net(_) => TransportKind::Net,
        }
    }

    /// Manufacturer data for a company id.
    #[must_use]
    pub fn manufacturer(&self, id: u16) -> Option<&[u8]> {
        match self {
            Self::Ble {
                manufacturer_data, ..
            } => manufacturer_data.get(&id).map(Vec::as_slice),
            Self::Net(_) => None,
        }
    }

    /// Returns true if the service is advertised.
    #[must_use]
    pub fn advertises(&self, service: Uuid) -> bool {
        match self {
            Self::Ble { services, .. } => services.contains(&service),
            Self::Net(_) => false,
        }
    }

    /// Model code of a discovery reply.
    #[must_use]
    pub const fn code(&self) -> Option<u8> {
        match self {
            Self::Net(discovery) => Some(discovery.code),
            Self::Ble { .. } => None,
        }
    }
}

/// Whether a channel report replaces or merges into the cached status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// Swap the whole status.
    Replace,
    /// Merge the reported attributes.
    Update,
}

/// Decoded status of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    /// Channel number.
    pub number: u8,
    /// Reported attributes.
    pub status: Status,
    /// How to apply the status.
    pub mode: ReportMode,
    /// New capability set, when the payload changes it.
    pub capabilities: Option<BTreeSet<Attribute>>,
}

impl ChannelReport {
    /// A report that replaces the cached status.
    #[must_use]
    pub const fn replace(number: u8, status: Status) -> Self {
        Self {
            number,
            status,
            mode: ReportMode::Replace,
            capabilities: None,
        }
    }

    /// A report merged into the cached status.
    #[must_use]
    pub const fn update(number: u8, status: Status) -> Self {
        Self {
            number,
            status,
            mode: ReportMode::Update,
            capabilities: None,
        }
    }

    /// Attaches a capability set.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: BTreeSet<Attribute>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }
}

/// Result of decoding one complete payload.
#[derive(Clone, Default)]
pub struct StatusReport {
    /// Per-channel changes.
    pub channels: Vec<ChannelReport>,
    /// New master context, if the payload changes it.
    pub context: Option<Context>,
}

impl StatusReport {
    /// A report covering the given channels.
    #[must_use]
    pub fn new(channels: Vec<ChannelReport>) -> Self {
        Self {
            channels,
            context: None,
        }
    }

    /// Returns the report for a channel.
    #[must_use]
    pub fn channel(&self, number: u8) -> Option<&ChannelReport> {
        self.channels.iter().find(|c| c.number == number)
    }
}

impl fmt::Debug for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusReport")
            .field("channels", &self.channels)
            .field("context", &self.context.is_some())
            .finish()
    }
}

/// Encodes one attribute change.
pub type EncodeFn<D> = fn(&D, &ChannelView, &Value) -> Result<Vec<Command>>;

/// Lists the options of a select-like attribute.
pub type ListFn<D> = fn(&D, &ChannelView) -> Option<Vec<String>>;

struct AttributeEntry<D> {
    encode: EncodeFn<D>,
    list: Option<ListFn<D>>,
}

/// Explicit attribute table of a descriptor.
pub struct AttributeMap<D> {
    entries: BTreeMap<Attribute, AttributeEntry<D>>,
}

impl<D> AttributeMap<D> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Adds an attribute with an encoder.
    #[must_use]
    pub fn with(mut self, attribute: Attribute, encode: EncodeFn<D>) -> Self {
        self.entries
            .insert(attribute, AttributeEntry { encode, list: None });
        self
    }

    /// Adds a select-like attribute with an encoder and an option list.
    #[must_use]
    pub fn with_list(mut self, attribute: Attribute, encode: EncodeFn<D>, list: ListFn<D>) -> Self {
        self.entries.insert(
            attribute,
            AttributeEntry {
                encode,
                list: Some(list),
            },
        );
        self
    }

    /// Returns true if the attribute can be encoded.
    #[must_use]
    pub fn contains(&self, attribute: Attribute) -> bool {
        self.entries.contains_key(&attribute)
    }

    /// Encodable attributes.
    #[must_use]
    pub fn attributes(&self) -> BTreeSet<Attribute> {
        self.entries.keys().copied().collect()
    }

    /// Runs the encoder of an attribute.
    pub fn encode(
        &self,
        descriptor: &D,
        view: &ChannelView,
        attribute: Attribute,
        value: &Value,
    ) -> Result<Vec<Command>> {
        let entry = self
            .entries
            .get(&attribute)
            .ok_or(Error::Unsupported { attribute })?;
        (entry.encode)(descriptor, view, value)
    }

    /// Runs the option list of an attribute.
    #[must_use]
    pub fn options(&self, descriptor: &D, view: &ChannelView, attribute: Attribute) -> Option<Vec<String>> {
        let list = self.entries.get(&attribute)?.list?;
        list(descriptor, view)
    }
}

impl<D> Default for AttributeMap<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> fmt::Debug for AttributeMap<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// Description of one controller family.
pub trait ModelDescriptor: Send + Sync + fmt::Debug {
    /// Model name, e.g. `SP110E`.
    fn name(&self) -> &str;

    /// Numeric model code.
    fn code(&self) -> u8;

    /// Manufacturer display name.
    fn manufacturer(&self) -> &str;

    /// Transport the family is reached over.
    fn transport(&self) -> TransportKind;

    /// Number of outputs.
    fn channels(&self) -> u8 {
        1
    }

    /// Returns true if channel 0 aggregates the outputs.
    fn master_channel(&self) -> bool {
        false
    }

    /// Returns true if the advertisement belongs to this family.
    fn matches(&self, advertisement: &Advertisement) -> bool;

    /// Endpoints the family uses.
    fn endpoints(&self) -> Endpoints;

    /// Handshake required after connecting.
    fn pairing(&self) -> Pairing {
        Pairing::None
    }

    /// Reassembly strategy for inbound traffic.
    fn framing(&self) -> Framing {
        Framing::Single
    }

    /// Frames sent ahead of the first command of a new session.
    fn on_connect(&self) -> Vec<Command> {
        Vec::new()
    }

    /// Frames sent right after subscribing.
    fn on_subscribe(&self) -> Vec<Command> {
        Vec::new()
    }

    /// Frames that make the device report its status.
    fn state_query(&self) -> Result<Vec<Command>>;

    /// Attributes channel `channel` supports before any status arrives.
    fn capabilities(&self, channel: u8) -> BTreeSet<Attribute>;

    /// Encodes an attribute change into one or more frames.
    fn encode(&self, view: &ChannelView, attribute: Attribute, value: &Value) -> Result<Vec<Command>>;

    /// Options of a select-like attribute.
    fn options(&self, view: &ChannelView, attribute: Attribute) -> Option<Vec<String>>;

    /// Effects available to the channel in its current mode.
    fn effect_catalog(&self, view: &ChannelView) -> Option<EffectCatalog>;

    /// Returns true if the channel can run the named effect.
    fn supports_effect(&self, view: &ChannelView, effect: &str) -> bool {
        self.effect_catalog(view)
            .is_some_and(|catalog| catalog.by_name(effect).is_some())
    }

    /// Decodes one complete payload.
    fn decode(&self, payload: &[u8], context: Option<&Context>) -> Result<StatusReport>;
}

/// Boolean argument of an encoder.
pub(crate) fn expect_bool(attribute: Attribute, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| Error::invalid(attribute, format!("expected a boolean, got {value}")))
}

/// Integer argument of an encoder, bounded to `min..=max`.
pub(crate) fn expect_ranged(attribute: Attribute, value: &Value, min: i64, max: i64) -> Result<i64> {
    value
        .as_ranged(min, max)
        .ok_or_else(|| Error::invalid(attribute, format!("{value} is outside {min}..={max}")))
}

/// Byte argument of an encoder.
pub(crate) fn expect_u8(attribute: Attribute, value: &Value) -> Result<u8> {
    value
        .as_int()
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| Error::invalid(attribute, format!("{value} is not a byte")))
}

/// Colour argument of an encoder.
pub(crate) fn expect_rgb(attribute: Attribute, value: &Value) -> Result<[u8; 3]> {
    value
        .as_rgb()
        .ok_or_else(|| Error::invalid(attribute, format!("expected a colour, got {value}")))
}

/// Resolves a select value by name or number against a name table.
pub(crate) fn expect_option(attribute: Attribute, value: &Value, table: &[&str]) -> Result<u8> {
    let code = match value {
        Value::Text(name) => chips::code(table, name),
        other => other
            .as_int()
            .and_then(|v| u8::try_from(v).ok())
            .filter(|v| usize::from(*v) < table.len()),
    };
    code.ok_or_else(|| Error::invalid(attribute, format!("unknown option {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Lamp;

    fn encode_power(_: &Lamp, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let on = expect_bool(Attribute::Power, value)?;
        Ok(vec![Command::write(vec![view.number, u8::from(on)])])
    }

    fn list_orders(_: &Lamp, _: &ChannelView) -> Option<Vec<String>> {
        Some(chips::names(&chips::RGB_ORDERS))
    }

    fn table() -> AttributeMap<Lamp> {
        AttributeMap::new()
            .with(Attribute::Power, encode_power)
            .with_list(Attribute::ChipOrder, |_, _, _| Ok(Vec::new()), list_orders)
    }

    #[test]
    fn test_attribute_map_dispatch() {
        let map = table();
        let view = ChannelView::new(2, Status::new());
        let frames = map
            .encode(&Lamp, &view, Attribute::Power, &Value::Bool(true))
            .unwrap();
        assert_eq!(frames, vec![Command::write(vec![2, 1])]);

        assert!(matches!(
            map.encode(&Lamp, &view, Attribute::Scene, &Value::Int(1)),
            Err(Error::Unsupported {
                attribute: Attribute::Scene
            })
        ));
        assert_eq!(map.options(&Lamp, &view, Attribute::ChipOrder).map(|o| o.len()), Some(6));
        assert_eq!(map.options(&Lamp, &view, Attribute::Power), None);
        assert_eq!(
            map.attributes(),
            BTreeSet::from([Attribute::Power, Attribute::ChipOrder])
        );
    }

    #[test]
    fn test_mandatory_endpoints() {
        let shared = Endpoints::shared(None, Endpoint::short(0xFFE1));
        assert_eq!(shared.mandatory(), vec![Endpoint::short(0xFFE1)]);

        let split = Endpoints {
            pair: Some(Endpoint::short(0x1914)),
            notify: Endpoint::short(0x1911),
            ..Endpoints::shared(None, Endpoint::short(0x1912))
        };
        assert_eq!(split.mandatory().len(), 3);
    }

    #[test]
    fn test_option_values() {
        let by_name = expect_option(Attribute::ChipOrder, &Value::from("grb"), &chips::RGB_ORDERS);
        assert_eq!(by_name.unwrap(), 2);
        let by_index = expect_option(Attribute::ChipOrder, &Value::Int(5), &chips::RGB_ORDERS);
        assert_eq!(by_index.unwrap(), 5);
        assert!(expect_option(Attribute::ChipOrder, &Value::Int(6), &chips::RGB_ORDERS).is_err());
    }

    #[test]
    fn test_advertisement_helpers() {
        let advertisement = Advertisement::Ble {
            address: "AA:BB:CC:DD:EE:FF".into(),
            name: Some("SP110E".into()),
            manufacturer_data: BTreeMap::from([(0u16, vec![0x10, 0x00])]),
            services: vec![],
        };
        assert_eq!(advertisement.name(), Some("SP110E"));
        assert_eq!(advertisement.manufacturer(0), Some(&[0x10, 0x00][..]));
        assert_eq!(advertisement.manufacturer(1), None);
        assert_eq!(advertisement.code(), None);
        assert_eq!(advertisement.transport(), TransportKind::Ble);
    }
}
