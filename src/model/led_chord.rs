//! LedChord SP107E music controller.
//!
//! Commands are four byte trailer frames. Settings carry the value first
//! and a fixed `50 4D` marker, `[value, 0x50, 0x4D, opcode]`; colours use
//! all three parameter bytes. Status arrives in two indexed parts that
//! join into one 26 byte block:
//! ```text
//! ┌───────┬───────┬──────┬──────────┬──────┬────────┬─────────────────┬───────┬───────┬───────┐
//! │ power │ order │ chip │ segments │ leds │ effect │ auto dyn/st/mx  │ speed │ level │ white │
//! │   0   │   1   │  2   │    3     │  4   │   5    │     6..=8       │   9   │  10   │  11   │
//! └───────┴───────┴──────┴──────────┴──────┴────────┴─────────────────┴───────┴───────┴───────┘
//! ┌─────┬────────────┬───────────┬────────────┬──────────┬──────┐
//! │  ?  │ static rgb │ strip rgb │ column rgb │ dot rgb  │ gain │
//! │ 12  │  13..=15   │  16..=18  │  19..=21   │ 22..=24  │  25  │
//! └─────┴────────────┴───────────┴────────────┴──────────┴──────┘
//! ```

use std::collections::BTreeSet;

use crate::channel::{ChannelView, Status};
use crate::error::{Error, Result};
use crate::model::chips;
use crate::model::{
    Advertisement, AttributeMap, ChannelReport, Command, Context, Effect, EffectCatalog,
    Endpoints, ModelDescriptor, StatusReport, expect_bool, expect_ranged, expect_rgb, expect_u8,
};
use crate::protocol::frame::{Envelope, Framing, IndexedForm};
use crate::transport::{Endpoint, short_uuid};
use crate::types::{Attribute, TransportKind, Value};

/// Company id carried in the advertisement.
pub const MANUFACTURER_ID: u16 = 0;

const STATUS_LEN: usize = 26;
const MARKER: [u8; 2] = [0x50, 0x4D];

const OP_POWER_ON: u8 = 0xAA;
const OP_POWER_OFF: u8 = 0xBB;
const OP_QUERY: u8 = 0x02;
const OP_MODE: u8 = 0x08;
const OP_SPEED: u8 = 0x09;
const OP_BRIGHTNESS: u8 = 0x0A;
const OP_WHITE: u8 = 0x0B;
const OP_STATIC_COLOR: u8 = 0x0C;
const OP_AUTO_DYNAMIC: u8 = 0x0D;
const OP_STRIP_COLOR: u8 = 0x0E;
const OP_AUTO_STRIP: u8 = 0x0F;
const OP_COLUMN_COLOR: u8 = 0x10;
const OP_AUTO_MATRIX: u8 = 0x12;

const EFFECT_SOLID: u8 = 0xB5;
const CYCLE_DYNAMIC: u8 = 0xB6;
const CYCLE_STRIP: u8 = 0xB7;
const CYCLE_MATRIX: u8 = 0xB8;
const SOUND_STRIP: u8 = 0xBE;
const SOUND_MATRIX: u8 = 0xDC;

const MAX_SPEED: i64 = 10;

static EFFECTS: [Effect; 17] = [
    Effect::solid(EFFECT_SOLID, "Solid"),
    Effect::dynamic(CYCLE_DYNAMIC, "Cycle all Dynamic FX's"),
    Effect::dynamic(0x01, "Dynamic FX 1"),
    Effect::dynamic(0x02, "Dynamic FX 2"),
    Effect::dynamic(0x03, "Dynamic FX 3"),
    Effect::dynamic(0x04, "Dynamic FX 4"),
    Effect::dynamic(0x0E, "Dynamic FX 14"),
    Effect::sound(CYCLE_STRIP, "Cycle all Strip FX's"),
    Effect::sound(SOUND_STRIP, "Strip FX 1").colorable(),
    Effect::sound(SOUND_STRIP + 2, "Strip FX 2").colorable(),
    Effect::sound(SOUND_STRIP + 3, "Strip FX 3").colorable(),
    Effect::sound(SOUND_STRIP + 4, "Strip FX 4").colorable(),
    Effect::sound(CYCLE_MATRIX, "Cycle all Matrix FX's"),
    Effect::sound(SOUND_MATRIX, "Matrix FX 1").colorable(),
    Effect::sound(SOUND_MATRIX + 1, "Matrix FX 2").colorable(),
    Effect::sound(SOUND_MATRIX + 2, "Matrix FX 3").colorable(),
    Effect::sound(SOUND_MATRIX + 3, "Matrix FX 4").colorable(),
];

fn catalog() -> EffectCatalog {
    EffectCatalog::new(&EFFECTS)
}

fn setting(opcode: u8, value: u8) -> Command {
    Command::write(Envelope::trailer(opcode, &[value, MARKER[0], MARKER[1]]))
}

/// Effect families, each with its own auto-cycle switch and colour slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    Static,
    Dynamic,
    Strip,
    Matrix,
}

impl Group {
    const fn of(effect: u8) -> Self {
        match effect {
            CYCLE_DYNAMIC => Self::Dynamic,
            CYCLE_STRIP => Self::Strip,
            CYCLE_MATRIX => Self::Matrix,
            n if n < EFFECT_SOLID => Self::Dynamic,
            n if n >= SOUND_MATRIX => Self::Matrix,
            n if n >= SOUND_STRIP => Self::Strip,
            _ => Self::Static,
        }
    }

    /// Pseudo effect number and switch opcode of the group's auto cycle.
    const fn cycle(self) -> Option<(u8, u8)> {
        match self {
            Self::Static => None,
            Self::Dynamic => Some((CYCLE_DYNAMIC, OP_AUTO_DYNAMIC)),
            Self::Strip => Some((CYCLE_STRIP, OP_AUTO_STRIP)),
            Self::Matrix => Some((CYCLE_MATRIX, OP_AUTO_MATRIX)),
        }
    }

    /// Status offset of the auto cycle flag.
    const fn auto_offset(self) -> Option<usize> {
        match self {
            Self::Static => None,
            Self::Dynamic => Some(6),
            Self::Strip => Some(7),
            Self::Matrix => Some(8),
        }
    }

    /// Colour opcode and status offset of the group's colour.
    const fn color(self) -> Option<(u8, usize)> {
        match self {
            Self::Static => Some((OP_STATIC_COLOR, 13)),
            Self::Dynamic => None,
            Self::Strip => Some((OP_STRIP_COLOR, 16)),
            Self::Matrix => Some((OP_COLUMN_COLOR, 19)),
        }
    }
}

/// SP107E descriptor.
#[derive(Debug)]
pub struct LedChord {
    attributes: AttributeMap<Self>,
}

impl LedChord {
    /// SP107E, advertising `00 00` under company id 0.
    #[must_use]
    pub fn sp107e() -> Self {
        let attributes = AttributeMap::new()
            .with(Attribute::Power, Self::encode_power)
            .with(Attribute::Brightness, Self::encode_brightness)
            .with(Attribute::White, Self::encode_white)
            .with(Attribute::RgbColor, Self::encode_rgb)
            .with_list(Attribute::Effect, Self::encode_effect, Self::list_effects)
            .with(Attribute::EffectSpeed, Self::encode_speed);
        Self { attributes }
    }

    fn current_group(view: &ChannelView) -> Group {
        view.status
            .get_int(Attribute::EffectNumber)
            .and_then(|v| u8::try_from(v).ok())
            .map_or(Group::Static, Group::of)
    }

    fn encode_power(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let opcode = if expect_bool(Attribute::Power, value)? {
            OP_POWER_ON
        } else {
            OP_POWER_OFF
        };
        Ok(vec![setting(opcode, 0x00)])
    }

    fn encode_brightness(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let level = expect_u8(Attribute::Brightness, value)?;
        Ok(vec![setting(OP_BRIGHTNESS, level)])
    }

    fn encode_white(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let white = expect_u8(Attribute::White, value)?;
        Ok(vec![setting(OP_WHITE, white)])
    }

    fn encode_rgb(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let rgb = expect_rgb(Attribute::RgbColor, value)?;
        let (opcode, _) = Self::current_group(view)
            .color()
            .ok_or_else(|| Error::invalid(Attribute::RgbColor, "current effect takes no colour"))?;
        Ok(vec![Command::write(Envelope::trailer(opcode, &rgb))])
    }

    fn encode_effect(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let effect = match value {
            Value::Text(name) => catalog().by_name(name),
            other => other
                .as_int()
                .and_then(|v| u8::try_from(v).ok())
                .and_then(|v| catalog().get(v)),
        }
        .ok_or_else(|| Error::invalid(Attribute::Effect, format!("unknown effect {value}")))?;

        let group = Group::of(effect.number);
        let cycle = group.cycle();
        if let Some((number, opcode)) = cycle {
            if effect.number == number {
                return Ok(vec![setting(opcode, 0x01)]);
            }
        }

        let mut frames = Vec::with_capacity(2);
        let current = view
            .status
            .get_int(Attribute::EffectNumber)
            .and_then(|v| u8::try_from(v).ok());
        if let Some((number, opcode)) = cycle {
            // The group's auto cycle would override the chosen effect
            if current == Some(number) {
                frames.push(setting(opcode, 0x00));
            }
        }
        frames.push(setting(OP_MODE, effect.number));
        Ok(frames)
    }

    fn list_effects(&self, _: &ChannelView) -> Option<Vec<String>> {
        Some(catalog().names())
    }

    fn encode_speed(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let speed = expect_ranged(Attribute::EffectSpeed, value, 1, MAX_SPEED)?;
        Ok(vec![setting(OP_SPEED, speed as u8)])
    }
}

impl ModelDescriptor for LedChord {
    fn name(&self) -> &str {
        "SP107E"
    }

    fn code(&self) -> u8 {
        0x00
    }

    fn manufacturer(&self) -> &str {
        "SPLED (LedChord)"
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn matches(&self, advertisement: &Advertisement) -> bool {
        advertisement
            .manufacturer(MANUFACTURER_ID)
            .is_some_and(|data| data.starts_with(&[0x00, 0x00]))
    }

    fn endpoints(&self) -> Endpoints {
        Endpoints::shared(Some(short_uuid(0xFFE0)), Endpoint::short(0xFFE1))
    }

    fn framing(&self) -> Framing {
        Framing::Indexed(IndexedForm { parts: 2 })
    }

    fn state_query(&self) -> Result<Vec<Command>> {
        Ok(vec![Command::write(Envelope::trailer(OP_QUERY, &[0, 0, 0]))])
    }

    fn capabilities(&self, _channel: u8) -> BTreeSet<Attribute> {
        self.attributes.attributes()
    }

    fn encode(&self, view: &ChannelView, attribute: Attribute, value: &Value) -> Result<Vec<Command>> {
        self.attributes.encode(self, view, attribute, value)
    }

    fn options(&self, view: &ChannelView, attribute: Attribute) -> Option<Vec<String>> {
        self.attributes.options(self, view, attribute)
    }

    fn effect_catalog(&self, _view: &ChannelView) -> Option<EffectCatalog> {
        Some(catalog())
    }

    fn decode(&self, payload: &[u8], _context: Option<&Context>) -> Result<StatusReport> {
        if payload.len() != STATUS_LEN {
            return Err(Error::decode(format!(
                "expected {STATUS_LEN} byte status, got {}",
                payload.len()
            )));
        }

        let raw = payload[5];
        let group = Group::of(raw);
        let cycling = group.auto_offset().is_some_and(|offset| payload[offset] != 0);
        let effect = match group.cycle() {
            Some((number, _)) if cycling => number,
            _ => raw,
        };
        let fx = catalog().get(effect);
        tracing::trace!("effect {:#04x} as {:?}, cycling {}", raw, group, cycling);

        let mut status = Status::new()
            .with(Attribute::Power, payload[0] != 0)
            .with(Attribute::EffectNumber, effect)
            .with(Attribute::EffectLoop, cycling)
            .with(Attribute::Brightness, payload[10])
            .with(Attribute::White, payload[11]);
        status.set(Attribute::Effect, fx.map(|fx| Value::from(fx.name.as_ref())));
        status.set(Attribute::EffectType, fx.map(|fx| Value::from(fx.kind.as_str())));
        status.set(
            Attribute::ChipOrder,
            chips::name(&chips::RGB_ORDERS, payload[1]).map(Value::from),
        );
        if group == Group::Dynamic {
            status.set(Attribute::EffectSpeed, Some(Value::from(payload[9])));
        }
        if let Some((_, offset)) = group.color() {
            let rgb = [payload[offset], payload[offset + 1], payload[offset + 2]];
            status.set(Attribute::RgbColor, Some(Value::from(rgb)));
        }

        Ok(StatusReport::new(vec![ChannelReport::replace(0, status)]))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::protocol::frame::FrameCodec;

    /// Controller stand-in that answers in two indexed parts.
    struct FakeSp107e {
        state: [u8; STATUS_LEN],
    }

    impl FakeSp107e {
        fn new() -> Self {
            let mut state = [0u8; STATUS_LEN];
            state[..13].copy_from_slice(&[0, 0, 3, 1, 60, EFFECT_SOLID, 0, 0, 0, 5, 0x80, 0, 0]);
            state[13..25].copy_from_slice(&[0x10, 0x20, 0x30, 0xFF, 0, 0, 0, 0xFF, 0, 0, 0, 0xFF]);
            state[25] = 8;
            Self { state }
        }

        fn apply(&mut self, command: &Command) {
            let [a, b, c, opcode] = command.data[..] else {
                panic!("unexpected frame {:?}", command.data);
            };
            match opcode {
                OP_POWER_ON => self.state[0] = 1,
                OP_POWER_OFF => self.state[0] = 0,
                OP_MODE => self.state[5] = a,
                OP_SPEED => self.state[9] = a,
                OP_BRIGHTNESS => self.state[10] = a,
                OP_WHITE => self.state[11] = a,
                OP_STATIC_COLOR => self.state[13..16].copy_from_slice(&[a, b, c]),
                OP_STRIP_COLOR => self.state[16..19].copy_from_slice(&[a, b, c]),
                OP_COLUMN_COLOR => self.state[19..22].copy_from_slice(&[a, b, c]),
                OP_AUTO_DYNAMIC | OP_AUTO_STRIP | OP_AUTO_MATRIX => {
                    let (group, first) = match opcode {
                        OP_AUTO_DYNAMIC => (Group::Dynamic, 0x01),
                        OP_AUTO_STRIP => (Group::Strip, SOUND_STRIP),
                        _ => (Group::Matrix, SOUND_MATRIX),
                    };
                    self.state[group.auto_offset().unwrap()] = a;
                    if a != 0 && Group::of(self.state[5]) != group {
                        self.state[5] = first;
                    }
                }
                other => panic!("unexpected opcode {other:#04x}"),
            }
        }

        fn notifications(&self) -> [Vec<u8>; 2] {
            let (first, second) = self.state.split_at(18);
            [[&[0x00, 0x01], first].concat(), [&[0x00, 0x02], second].concat()]
        }
    }

    fn reassemble(device: &FakeSp107e) -> Status {
        let model = LedChord::sp107e();
        let mut codec = FrameCodec::new(model.framing());
        let [first, second] = device.notifications();
        assert_eq!(codec.feed(&first).unwrap(), None);
        let payload = codec.feed(&second).unwrap().unwrap();
        let report = model.decode(&payload, None).unwrap();
        report.channel(0).unwrap().status.clone()
    }

    fn view(number: u8) -> ChannelView {
        ChannelView::new(0, Status::new().with(Attribute::EffectNumber, number))
    }

    #[test]
    fn test_identification() {
        let advertisement = Advertisement::Ble {
            address: "AA:BB:CC:DD:EE:07".into(),
            name: Some("SP107E".into()),
            manufacturer_data: BTreeMap::from([(MANUFACTURER_ID, vec![0x00, 0x00])]),
            services: vec![],
        };
        assert!(LedChord::sp107e().matches(&advertisement));
        assert_eq!(
            &LedChord::sp107e().state_query().unwrap()[0].data[..],
            &[0, 0, 0, OP_QUERY]
        );
    }

    #[test]
    fn test_encode_frames() {
        let model = LedChord::sp107e();

        let frames = model.encode(&view(EFFECT_SOLID), Attribute::Power, &Value::from(false)).unwrap();
        assert_eq!(&frames[0].data[..], &[0x00, 0x50, 0x4D, 0xBB]);

        let frames = model
            .encode(&view(EFFECT_SOLID), Attribute::RgbColor, &Value::from([1, 2, 3]))
            .unwrap();
        assert_eq!(&frames[0].data[..], &[1, 2, 3, OP_STATIC_COLOR]);

        let frames = model
            .encode(&view(SOUND_MATRIX), Attribute::RgbColor, &Value::from([1, 2, 3]))
            .unwrap();
        assert_eq!(&frames[0].data[..], &[1, 2, 3, OP_COLUMN_COLOR]);

        assert!(matches!(
            model.encode(&view(0x02), Attribute::RgbColor, &Value::from([1, 2, 3])),
            Err(Error::InvalidValue { .. })
        ));

        let frames = model
            .encode(&view(EFFECT_SOLID), Attribute::Effect, &Value::from("Cycle all Strip FX's"))
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].data[..], &[0x01, 0x50, 0x4D, OP_AUTO_STRIP]);

        // Leaving a cycle turns it off before picking the effect
        let frames = model
            .encode(&view(CYCLE_STRIP), Attribute::Effect, &Value::from("Strip FX 3"))
            .unwrap();
        assert_eq!(&frames[0].data[..], &[0x00, 0x50, 0x4D, OP_AUTO_STRIP]);
        assert_eq!(&frames[1].data[..], &[SOUND_STRIP + 3, 0x50, 0x4D, OP_MODE]);

        assert!(model.encode(&view(0x01), Attribute::EffectSpeed, &Value::from(11u8)).is_err());
        assert!(model.encode(&view(0x01), Attribute::Effect, &Value::from(0x05u8)).is_err());
    }

    #[test]
    fn test_decode_groups() {
        let mut device = FakeSp107e::new();
        let status = reassemble(&device);
        assert_eq!(status.get_bool(Attribute::Power), Some(false));
        assert_eq!(status.get_text(Attribute::Effect), Some("Solid"));
        assert_eq!(status.get_text(Attribute::EffectType), Some("Static"));
        assert_eq!(status.get(Attribute::RgbColor), Some(&Value::Rgb([0x10, 0x20, 0x30])));
        assert!(!status.has(Attribute::EffectSpeed));

        device.state[5] = 0x02;
        device.state[6] = 1;
        let status = reassemble(&device);
        assert_eq!(status.get_text(Attribute::Effect), Some("Cycle all Dynamic FX's"));
        assert_eq!(status.get_bool(Attribute::EffectLoop), Some(true));
        assert_eq!(status.get_int(Attribute::EffectSpeed), Some(5));
        assert!(!status.has(Attribute::RgbColor));

        device.state[5] = SOUND_STRIP;
        let status = reassemble(&device);
        assert_eq!(status.get_text(Attribute::Effect), Some("Strip FX 1"));
        assert_eq!(status.get_text(Attribute::EffectType), Some("Sound"));
        assert_eq!(status.get(Attribute::RgbColor), Some(&Value::Rgb([0xFF, 0, 0])));

        let model = LedChord::sp107e();
        assert!(matches!(model.decode(&[0; 18], None), Err(Error::Decode { .. })));
    }

    #[test]
    fn test_encode_decode_consistency() {
        let model = LedChord::sp107e();
        let mut device = FakeSp107e::new();
        let changes = [
            (Attribute::Power, Value::from(true)),
            (Attribute::RgbColor, Value::from([1, 2, 3])),
            (Attribute::Effect, Value::from("Dynamic FX 3")),
            (Attribute::EffectSpeed, Value::from(7u8)),
            (Attribute::Effect, Value::from("Cycle all Dynamic FX's")),
            (Attribute::Effect, Value::from("Strip FX 2")),
            (Attribute::RgbColor, Value::from([4, 5, 6])),
            (Attribute::Effect, Value::from("Cycle all Matrix FX's")),
            (Attribute::Effect, Value::from("Matrix FX 2")),
            (Attribute::RgbColor, Value::from([7, 8, 9])),
            (Attribute::Brightness, Value::from(0x40u8)),
            (Attribute::White, Value::from(0x11u8)),
        ];

        let mut status = reassemble(&device);
        for (attribute, value) in changes {
            let view = ChannelView::new(0, status.clone());
            for command in model.encode(&view, attribute, &value).unwrap() {
                device.apply(&command);
            }
            status = reassemble(&device);
            assert_eq!(status.get(attribute), Some(&value), "{attribute}");
        }
        assert_eq!(device.state[8], 0);
        assert_eq!(status.get_bool(Attribute::EffectLoop), Some(false));
    }
}
