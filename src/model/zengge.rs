//! Zengge lights on an encrypted Telink mesh.
//!
//! Commands are plaintext `[dest_lo, dest_hi, opcode, params...]` that the
//! session seals with the mesh key. Parameters always take the same shape:
//! ```text
//! ┌──────┬─────┬────┬────┬────┬──────────┬────────────┐
//! │ 0xFF │ sub │ v1 │ v2 │ v3 │ delay LE │ gradual LE │
//! └──────┴─────┴────┴────┴────┴──────────┴────────────┘
//! ```
//! An opened notification with opcode `0xDC` at offset 7 carries the status
//! of two nodes, one 5-byte record each at offsets 10 and 15:
//! `[node id, connected, level %, mode << 6 | v2, v1]`.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::channel::{ChannelView, Status};
use crate::error::Result;
use crate::model::{
    Advertisement, AttributeMap, ChannelReport, Command, Context, EffectCatalog, Endpoints,
    ModelDescriptor, Pairing, StatusReport, expect_bool, expect_rgb, expect_u8,
};
use crate::transport::Endpoint;
use crate::types::{Attribute, TransportKind, Value};

/// Company id carried in the advertisement.
pub const MANUFACTURER_ID: u16 = 63517;

/// Telink mesh service.
pub const SERVICE: Uuid = Uuid::from_u128(0x0001_0203_0405_0607_0809_0a0b_0c0d_1910);
const STATUS_CHAR: Uuid = Uuid::from_u128(0x0001_0203_0405_0607_0809_0a0b_0c0d_1911);
const COMMAND_CHAR: Uuid = Uuid::from_u128(0x0001_0203_0405_0607_0809_0a0b_0c0d_1912);
const PAIR_CHAR: Uuid = Uuid::from_u128(0x0001_0203_0405_0607_0809_0a0b_0c0d_1914);

/// Destination addressing every node.
pub const BROADCAST: u16 = 0xFFFF;

const OP_POWER: u8 = 0xD0;
const OP_COLOR: u8 = 0xE2;
const OP_NOTIFICATION: u8 = 0xDC;

const SUB_POWER: u8 = 0x01;
const SUB_BRIGHTNESS: u8 = 0x02;
const COLOR_MODE_RGB: u8 = 0x60;
const COLOR_MODE_WHITE: u8 = 0x61;
const DIMMING_AUTO: u8 = 0x06;
const DEVICE_TYPE_ANY: u8 = 0xFF;

const NODE_NONE: u8 = 0x00;
const NODE_BRIDGE: u8 = 0xFF;

const OPCODE_OFFSET: usize = 7;
const RECORD_OFFSETS: [usize; 2] = [10, 15];
const RECORD_LEN: usize = 5;

fn percent(level: u8) -> u8 {
    (f64::from(level) * 100.0 / 255.0).round() as u8
}

fn from_percent(level: u8) -> u8 {
    (f64::from(level.min(100)) * 255.0 / 100.0).round() as u8
}

/// Fully saturated colour for a hue on the 0..=255 wheel.
fn hue_rgb(hue: u8) -> [u8; 3] {
    let degrees = if hue <= 128 {
        (f64::from(hue) * 360.0 / 254.0).round()
    } else {
        (f64::from(hue) * 360.0 / 255.0).round()
    };
    let h = degrees / 360.0;
    let channel = |v: f64| {
        let v = (v.clamp(0.0, 1.0) * 255.0).round();
        if v >= 250.0 { 255 } else { v as u8 }
    };
    [
        channel((h * 6.0 - 3.0).abs() - 1.0),
        channel(2.0 - (h * 6.0 - 2.0).abs()),
        channel(2.0 - (h * 6.0 - 4.0).abs()),
    ]
}

/// Zengge mesh descriptor.
#[derive(Debug)]
pub struct Zengge {
    attributes: AttributeMap<Self>,
}

impl Zengge {
    /// Creates the descriptor.
    #[must_use]
    pub fn new() -> Self {
        let attributes = AttributeMap::new()
            .with(Attribute::Power, Self::encode_power)
            .with(Attribute::Brightness, Self::encode_brightness)
            .with(Attribute::RgbColor, Self::encode_rgb)
            .with(Attribute::White, Self::encode_white);
        Self { attributes }
    }

    fn destination(view: &ChannelView) -> u16 {
        if view.number == 0 {
            BROADCAST
        } else {
            u16::from(view.number)
        }
    }

    fn command(view: &ChannelView, opcode: u8, sub: u8, values: [u8; 3]) -> Vec<Command> {
        let [lo, hi] = Self::destination(view).to_le_bytes();
        let [v1, v2, v3] = values;
        vec![Command::write(vec![
            lo,
            hi,
            opcode,
            DEVICE_TYPE_ANY,
            sub,
            v1,
            v2,
            v3,
            0x00,
            0x00,
            0x00,
            0x00,
        ])]
    }

    fn encode_power(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let on = expect_bool(Attribute::Power, value)?;
        let state = if on { 0xFF } else { 0x00 };
        Ok(Self::command(view, OP_POWER, SUB_POWER, [state, 0, 0]))
    }

    fn encode_brightness(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let level = expect_u8(Attribute::Brightness, value)?;
        Ok(Self::command(
            view,
            OP_POWER,
            SUB_BRIGHTNESS,
            [percent(level), DIMMING_AUTO, 0],
        ))
    }

    fn encode_rgb(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let rgb = expect_rgb(Attribute::RgbColor, value)?;
        Ok(Self::command(view, OP_COLOR, COLOR_MODE_RGB, rgb))
    }

    fn encode_white(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let level = expect_u8(Attribute::White, value)?;
        Ok(Self::command(view, OP_COLOR, COLOR_MODE_WHITE, [level, 0, 0]))
    }

    fn decode_node(record: &[u8]) -> Option<ChannelReport> {
        let id = record[0];
        if id == NODE_NONE {
            return None;
        }
        if id == NODE_BRIDGE {
            tracing::debug!("bridge status: {}", hex::encode(record));
            return None;
        }
        let connected = record[1] != 0;
        let level = record[2];
        let mode = record[3] >> 6;
        let value1 = record[4];

        let mut status = Status::new()
            .with(Attribute::NodeId, id)
            .with(Attribute::Online, connected)
            .with(Attribute::Effect, "Solid");
        if connected {
            let power = level != 0;
            status.set(Attribute::Power, Some(Value::from(power)));
            if power {
                status.set(Attribute::Brightness, Some(Value::from(from_percent(level))));
                match mode {
                    0 => status.set(Attribute::RgbColor, Some(Value::from(hue_rgb(value1)))),
                    1 => status.set(Attribute::White, Some(Value::from(from_percent(level)))),
                    _ => tracing::trace!("node {id} in mode {mode}"),
                }
            }
        }
        Some(ChannelReport::replace(id, status).with_capabilities(Self::node_capabilities()))
    }

    fn node_capabilities() -> BTreeSet<Attribute> {
        BTreeSet::from([
            Attribute::Power,
            Attribute::Brightness,
            Attribute::RgbColor,
            Attribute::White,
        ])
    }
}

impl Default for Zengge {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelDescriptor for Zengge {
    fn name(&self) -> &str {
        "Zengge Mesh"
    }

    fn code(&self) -> u8 {
        0x00
    }

    fn manufacturer(&self) -> &str {
        "Zengge"
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Mesh
    }

    fn channels(&self) -> u8 {
        0
    }

    fn master_channel(&self) -> bool {
        true
    }

    fn matches(&self, advertisement: &Advertisement) -> bool {
        advertisement.manufacturer(MANUFACTURER_ID).is_some()
    }

    fn endpoints(&self) -> Endpoints {
        Endpoints {
            service: Some(SERVICE),
            write: Endpoint::Characteristic(COMMAND_CHAR),
            notify: Endpoint::Characteristic(STATUS_CHAR),
            read: None,
            pair: Some(Endpoint::Characteristic(PAIR_CHAR)),
        }
    }

    fn pairing(&self) -> Pairing {
        Pairing::Mesh
    }

    fn on_subscribe(&self) -> Vec<Command> {
        vec![Command::notify(vec![0x01])]
    }

    fn state_query(&self) -> Result<Vec<Command>> {
        Ok(vec![Command::notify(vec![0x01])])
    }

    fn capabilities(&self, _channel: u8) -> BTreeSet<Attribute> {
        Self::node_capabilities()
    }

    fn encode(&self, view: &ChannelView, attribute: Attribute, value: &Value) -> Result<Vec<Command>> {
        self.attributes.encode(self, view, attribute, value)
    }

    fn options(&self, view: &ChannelView, attribute: Attribute) -> Option<Vec<String>> {
        self.attributes.options(self, view, attribute)
    }

    fn effect_catalog(&self, _view: &ChannelView) -> Option<EffectCatalog> {
        None
    }

    fn decode(&self, payload: &[u8], _context: Option<&Context>) -> Result<StatusReport> {
        match payload.get(OPCODE_OFFSET) {
            Some(&OP_NOTIFICATION) => {}
            Some(other) => {
                tracing::debug!("ignoring mesh opcode {other:#04x}");
                return Ok(StatusReport::default());
            }
            None => return Ok(StatusReport::default()),
        }
        let channels = RECORD_OFFSETS
            .iter()
            .filter_map(|&offset| payload.get(offset..offset + RECORD_LEN))
            .filter_map(Self::decode_node)
            .collect();
        Ok(StatusReport::new(channels))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::mesh::tests::{MAC, SimulatedNode};
    use crate::mesh::{MeshCredentials, MeshCrypto, MeshSession};
    use crate::mesh::crypto::Block;

    fn paired() -> (SimulatedNode, MeshSession, Block) {
        let credentials = MeshCredentials::default();
        let node = SimulatedNode::new(&credentials);
        let crypto = MeshCrypto::new(&credentials);
        let request = crypto.pair_request();
        let reply = node.reply(request.packet());
        let session = crypto.complete(&request, &reply, MAC).unwrap();
        let key = node.session_key(&request.nonce());
        (node, session, key)
    }

    /// Status body as a node sends it, starting at the opcode.
    fn notification(records: [[u8; RECORD_LEN]; 2]) -> Vec<u8> {
        let mut body = vec![OP_NOTIFICATION, 0x11, 0x02];
        body.extend_from_slice(&records[0]);
        body.extend_from_slice(&records[1]);
        body
    }

    fn plain(body: &[u8]) -> Vec<u8> {
        let mut payload = vec![0u8; OPCODE_OFFSET];
        payload.extend_from_slice(body);
        payload
    }

    #[test]
    fn test_identification() {
        let model = Zengge::new();
        let advertisement = Advertisement::Ble {
            address: "A4:C1:38:01:02:03".into(),
            name: None,
            manufacturer_data: BTreeMap::from([(MANUFACTURER_ID, vec![0x11, 0x02])]),
            services: vec![SERVICE],
        };
        assert!(model.matches(&advertisement));
        assert_eq!(model.pairing(), Pairing::Mesh);
        assert_eq!(model.endpoints().mandatory().len(), 3);
        assert_eq!(model.on_subscribe(), vec![Command::notify(vec![0x01])]);
        assert_eq!(model.state_query().unwrap()[0].target, crate::model::Target::Notify);
    }

    #[test]
    fn test_command_layout() {
        let model = Zengge::new();
        let master = ChannelView::new(0, Status::new());
        let node = ChannelView::new(0x12, Status::new());

        let frames = model.encode(&master, Attribute::Power, &Value::from(true)).unwrap();
        assert_eq!(
            &frames[0].data[..],
            &[0xFF, 0xFF, 0xD0, 0xFF, 0x01, 0xFF, 0, 0, 0, 0, 0, 0]
        );

        let frames = model.encode(&node, Attribute::Brightness, &Value::from(128u8)).unwrap();
        assert_eq!(&frames[0].data[..6], &[0x12, 0x00, 0xD0, 0xFF, 0x02, 50]);
        assert_eq!(frames[0].data[6], DIMMING_AUTO);

        let frames = model
            .encode(&node, Attribute::RgbColor, &Value::from([1, 2, 3]))
            .unwrap();
        assert_eq!(&frames[0].data[2..8], &[0xE2, 0xFF, 0x60, 1, 2, 3]);

        let frames = model.encode(&node, Attribute::White, &Value::from(200u8)).unwrap();
        assert_eq!(&frames[0].data[2..6], &[0xE2, 0xFF, 0x61, 200]);
        assert!(model.effect_catalog(&node).is_none());
    }

    #[test]
    fn test_decode_node_records() {
        let model = Zengge::new();
        let payload = plain(&notification([
            [0x11, 0xB1, 100, 0x00, 0x00],
            [0x10, 0x45, 0, 0x00, 0x00],
        ]));
        let report = model.decode(&payload, None).unwrap();
        assert_eq!(report.channels.len(), 2);

        let first = &report.channel(0x11).unwrap().status;
        assert_eq!(first.get_int(Attribute::NodeId), Some(0x11));
        assert_eq!(first.get_bool(Attribute::Online), Some(true));
        assert_eq!(first.get_bool(Attribute::Power), Some(true));
        assert_eq!(first.get_int(Attribute::Brightness), Some(255));
        assert_eq!(first.get(Attribute::RgbColor), Some(&Value::from([255, 0, 0])));
        assert_eq!(first.get_text(Attribute::Effect), Some("Solid"));

        let second = &report.channel(0x10).unwrap().status;
        assert_eq!(second.get_bool(Attribute::Power), Some(false));
        assert!(!second.has(Attribute::Brightness));
        assert!(report.channel(0x10).unwrap().capabilities.is_some());
    }

    #[test]
    fn test_decode_skips_empty_and_foreign() {
        let model = Zengge::new();
        let payload = plain(&notification([
            [0x00, 0, 0, 0, 0],
            [0x21, 0x00, 50, 0x40, 0x00],
        ]));
        let report = model.decode(&payload, None).unwrap();
        assert_eq!(report.channels.len(), 1);
        let offline = &report.channel(0x21).unwrap().status;
        assert_eq!(offline.get_bool(Attribute::Online), Some(false));
        assert!(!offline.has(Attribute::Power));

        let mut other = payload.clone();
        other[OPCODE_OFFSET] = 0xDB;
        assert!(model.decode(&other, None).unwrap().channels.is_empty());
        assert!(model.decode(&[0; 3], None).unwrap().channels.is_empty());
    }

    #[test]
    fn test_white_mode_and_hue() {
        let model = Zengge::new();
        let payload = plain(&notification([
            [0x05, 0x01, 40, 0x40, 0x00],
            [0x06, 0x01, 100, 0x00, 85],
        ]));
        let report = model.decode(&payload, None).unwrap();
        let white = &report.channel(0x05).unwrap().status;
        assert_eq!(white.get_int(Attribute::White), Some(102));
        assert!(!white.has(Attribute::RgbColor));

        let green = &report.channel(0x06).unwrap().status;
        assert_eq!(green.get(Attribute::RgbColor), Some(&Value::from([0, 255, 0])));
    }

    #[test]
    fn test_sealed_round_trip() {
        let model = Zengge::new();
        let (node, session, key) = paired();
        let view = ChannelView::new(0x11, Status::new());

        let frames = model.encode(&view, Attribute::Brightness, &Value::from(51u8)).unwrap();
        let packet = session.seal(&frames[0].data).unwrap();
        let received = node.receive(&key, &packet).unwrap();
        assert_eq!(&received[..3], &[0x11, 0x00, OP_POWER]);
        assert_eq!(&received[5..8], &[DEVICE_TYPE_ANY, SUB_BRIGHTNESS, 20]);

        let level = received[7];
        let body = notification([[0x11, 0x01, level, 0x00, 0x00], [0; RECORD_LEN]]);
        let packet = node.notify(&key, [0x01, 0x02, 0x03, 0x00, 0x00], &body);
        let opened = session.open(&packet).unwrap();
        let report = model.decode(&opened, None).unwrap();
        let status = &report.channel(0x11).unwrap().status;
        assert_eq!(status.get_int(Attribute::Brightness), Some(51));
    }
}
