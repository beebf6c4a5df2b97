//! BanlanX SP602E and SP608E multi-output SPI controllers.
//!
//! Commands use a header envelope with a channel mask as the first payload
//! byte, `0xFF` addressing every output:
//! ```text
//! ┌──────┬────────┬────────┬──────┬──────────┐
//! │ 0x88 │ opcode │ length │ mask │  params  │
//! └──────┴────────┴────────┴──────┴──────────┘
//! ```
//! Status arrives as long-form notifications. The reassembled payload holds
//! one 11-byte record per output, then the master settings:
//! ```text
//! ┌───────┬────────┬───────┬───────┬───────┬───────────┬───────────┬─────┬─────┬─────┐
//! │ power │ effect │ order │ level │ speed │ length BE │ direction │  r  │  g  │  b  │
//! └───────┴────────┴───────┴───────┴───────┴───────────┴───────────┴─────┴─────┴─────┘
//! ┌──────┬────────┬──────────────┬───────────────┬───────────┐
//! │ gain │ timers │ timers × 7   │ triggers × 13 │ auto loop │
//! └──────┴────────┴──────────────┴───────────────┴───────────┘
//! ```

use std::collections::BTreeSet;

use crate::channel::{ChannelView, Status};
use crate::error::{Error, Result};
use crate::model::chips;
use crate::model::{
    Advertisement, AttributeMap, ChannelReport, Command, Context, Effect, EffectCatalog,
    EffectKind, Endpoints, ModelDescriptor, StatusReport, expect_bool, expect_option,
    expect_ranged, expect_rgb, expect_u8,
};
use crate::protocol::frame::{Envelope, Framing, HeaderForm, LengthField, LongForm};
use crate::transport::{Endpoint, short_uuid};
use crate::types::{Attribute, TransportKind, Value};

/// Company id carried in the advertisement.
pub const MANUFACTURER_ID: u16 = 20563;

const ENVELOPE: Envelope = Envelope::Header(HeaderForm {
    magic: &[0x88],
    key: None,
    flags: &[],
    length: LengthField::U8,
});

const STATUS_MAGIC: [u8; 2] = [0x36, 0x38];

const OP_POWER: u8 = 0x82;
const OP_EFFECT: u8 = 0x83;
const OP_CHIP_ORDER: u8 = 0x84;
const OP_BRIGHTNESS: u8 = 0x85;
const OP_SPEED: u8 = 0x86;
const OP_LENGTH: u8 = 0x87;
const OP_AUDIO_INPUT: u8 = 0x88;
const OP_COLOR: u8 = 0x89;
const OP_DIRECTION: u8 = 0x8A;
const OP_SENSITIVITY: u8 = 0x8B;
const OP_SCENE: u8 = 0x8E;
const OP_QUERY: u8 = 0x8F;
const OP_SCENE_LOOP: u8 = 0x90;

const ALL_CHANNELS: u8 = 0xFF;
const CHANNEL_RECORD_LEN: usize = 11;
const TIMER_RECORD_LEN: usize = 7;
const TRIGGER_RECORD_LEN: usize = 13;
const MAX_TRIGGERS: usize = 4;

const MAX_SPEED: i64 = 10;
const MAX_LENGTH: i64 = 240;
const MAX_SENSITIVITY: i64 = 16;
const SCENES: i64 = 9;

const EFFECT_SOLID: u8 = 0x19;
const EFFECT_SOUND: u8 = 0x65;

const AUDIO_INPUTS: [&str; 3] = ["Int. Mic", "Player", "Aux In"];

static EFFECTS: [Effect; 41] = [
    Effect::solid(EFFECT_SOLID, "Solid"),
    Effect::dynamic(0x01, "Rainbow").directional(),
    Effect::dynamic(0x02, "Rainbow Stars"),
    Effect::dynamic(0x03, "Twinkle Stars").colorable(),
    Effect::dynamic(0x04, "Fire").directional(),
    Effect::dynamic(0x05, "Stacking").colorable().directional().sizeable(),
    Effect::dynamic(0x06, "Comet").colorable().directional().sizeable(),
    Effect::dynamic(0x07, "Wave").colorable().directional().sizeable(),
    Effect::dynamic(0x08, "Chasing").colorable().directional().sizeable(),
    Effect::dynamic(0x09, "Red/Blue/White").directional(),
    Effect::dynamic(0x0A, "Green/Yellow/White").directional(),
    Effect::dynamic(0x0B, "Red/Green/White").directional(),
    Effect::dynamic(0x0C, "Red/Yellow").directional(),
    Effect::dynamic(0x0D, "Red/White").directional(),
    Effect::dynamic(0x0E, "Green/White").directional(),
    Effect::dynamic(0x0F, "Gradient"),
    Effect::dynamic(0x10, "Wiping").colorable().directional().sizeable(),
    Effect::dynamic(0x11, "Breath").colorable(),
    Effect::dynamic(0x12, "Full Color Comet Wiping").colorable(),
    Effect::dynamic(0x13, "Comet Wiping").colorable(),
    Effect::dynamic(0x14, "Pixel Dot Wiping").colorable(),
    Effect::dynamic(0x15, "Full Color Meteor Rain").directional(),
    Effect::dynamic(0x16, "Meteor Rain").colorable().directional().sizeable(),
    Effect::dynamic(0x17, "Color Dots").directional(),
    Effect::dynamic(0x18, "Color Block").directional(),
    Effect::sound(EFFECT_SOUND, "Sound - Full Color Rhythm Spectrum"),
    Effect::sound(0x66, "Sound - Single Color Rhythm Spectrum").colorable(),
    Effect::sound(0x67, "Sound - Full Color Rhythm Stars"),
    Effect::sound(0x68, "Sound - Single Color Rhythm Stars").colorable(),
    Effect::sound(0x69, "Sound - Full Color Beat Injection").directional(),
    Effect::sound(0x6A, "Sound - Beat Injection").colorable().directional(),
    Effect::sound(0x6B, "Sound - Gradient Energy"),
    Effect::sound(0x6C, "Sound - Single Color Energy").colorable(),
    Effect::sound(0x6D, "Sound - Gradient Pulse"),
    Effect::sound(0x6E, "Sound - Single Color Pulse").colorable(),
    Effect::sound(0x6F, "Sound - Full Color Ripple"),
    Effect::sound(0x70, "Sound - Ripple").colorable(),
    Effect::sound(0x71, "Sound - Love & Peace"),
    Effect::sound(0x72, "Sound - Christmas"),
    Effect::sound(0x73, "Sound - Heartbeat"),
    Effect::sound(0x74, "Sound - Party"),
];

fn catalog() -> EffectCatalog {
    EffectCatalog::new(&EFFECTS)
}

fn mask(view: &ChannelView) -> u8 {
    if view.number == 0 {
        ALL_CHANNELS
    } else {
        1u8 << (view.number - 1)
    }
}

fn masked(view: &ChannelView, opcode: u8, params: &[u8]) -> Result<Vec<Command>> {
    let mut payload = Vec::with_capacity(params.len() + 1);
    payload.push(mask(view));
    payload.extend_from_slice(params);
    Ok(vec![Command::write(ENVELOPE.encode(opcode, &payload)?)])
}

#[derive(Default)]
struct MasterTotals {
    channels: u8,
    powered: bool,
    level: u32,
}

/// SP60xE descriptor.
#[derive(Debug)]
pub struct BanlanX {
    name: &'static str,
    code: u8,
    channels: u8,
    attributes: AttributeMap<Self>,
}

impl BanlanX {
    /// Four output controller.
    #[must_use]
    pub fn sp602e() -> Self {
        Self::new("SP602E", 0x02, 4)
    }

    /// Eight output controller.
    #[must_use]
    pub fn sp608e() -> Self {
        Self::new("SP608E", 0x05, 8)
    }

    fn new(name: &'static str, code: u8, channels: u8) -> Self {
        let attributes = AttributeMap::new()
            .with(Attribute::Power, Self::encode_power)
            .with(Attribute::Brightness, Self::encode_brightness)
            .with(Attribute::RgbColor, Self::encode_rgb)
            .with_list(Attribute::Effect, Self::encode_effect, Self::list_effects)
            .with(Attribute::EffectSpeed, Self::encode_speed)
            .with(Attribute::EffectLength, Self::encode_length)
            .with(Attribute::EffectDirection, Self::encode_direction)
            .with_list(Attribute::ChipOrder, Self::encode_chip_order, Self::list_chip_orders)
            .with_list(Attribute::AudioInput, Self::encode_audio_input, Self::list_audio_inputs)
            .with(Attribute::Sensitivity, Self::encode_sensitivity)
            .with(Attribute::Scene, Self::encode_scene)
            .with(Attribute::SceneLoop, Self::encode_scene_loop);
        Self {
            name,
            code,
            channels,
            attributes,
        }
    }

    fn encode_power(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let on = expect_bool(Attribute::Power, value)?;
        masked(view, OP_POWER, &[u8::from(on)])
    }

    fn encode_brightness(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let level = expect_u8(Attribute::Brightness, value)?;
        masked(view, OP_BRIGHTNESS, &[level])
    }

    fn encode_rgb(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let [r, g, b] = expect_rgb(Attribute::RgbColor, value)?;
        masked(view, OP_COLOR, &[r, g, b, 0xFF])
    }

    fn encode_effect(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        if view.number == 0 {
            return Err(Error::Unsupported {
                attribute: Attribute::Effect,
            });
        }
        let effect = match value {
            Value::Text(name) => catalog().by_name(name),
            other => other
                .as_int()
                .and_then(|v| u8::try_from(v).ok())
                .and_then(|v| catalog().get(v)),
        }
        .ok_or_else(|| Error::invalid(Attribute::Effect, format!("unknown effect {value}")))?;
        masked(view, OP_EFFECT, &[effect.number])
    }

    fn list_effects(&self, view: &ChannelView) -> Option<Vec<String>> {
        (view.number != 0).then(|| catalog().names())
    }

    fn encode_speed(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let speed = expect_ranged(Attribute::EffectSpeed, value, 1, MAX_SPEED)?;
        masked(view, OP_SPEED, &[speed as u8])
    }

    fn encode_length(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let length = expect_ranged(Attribute::EffectLength, value, 1, MAX_LENGTH)?;
        masked(view, OP_LENGTH, &(length as u16).to_be_bytes())
    }

    fn encode_direction(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let forward = expect_bool(Attribute::EffectDirection, value)?;
        masked(view, OP_DIRECTION, &[u8::from(forward)])
    }

    fn encode_chip_order(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let order = expect_option(Attribute::ChipOrder, value, &chips::RGB_ORDERS)?;
        masked(view, OP_CHIP_ORDER, &[order])
    }

    fn list_chip_orders(&self, _: &ChannelView) -> Option<Vec<String>> {
        Some(chips::names(&chips::RGB_ORDERS))
    }

    fn encode_audio_input(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let input = expect_option(Attribute::AudioInput, value, &AUDIO_INPUTS)?;
        masked(view, OP_AUDIO_INPUT, &[input])
    }

    fn list_audio_inputs(&self, _: &ChannelView) -> Option<Vec<String>> {
        Some(chips::names(&AUDIO_INPUTS))
    }

    fn encode_sensitivity(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let gain = expect_ranged(Attribute::Sensitivity, value, 1, MAX_SENSITIVITY)?;
        masked(view, OP_SENSITIVITY, &[gain as u8])
    }

    fn encode_scene(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let scene = expect_ranged(Attribute::Scene, value, 0, SCENES - 1)?;
        Ok(vec![Command::write(ENVELOPE.encode(OP_SCENE, &[scene as u8])?)])
    }

    fn encode_scene_loop(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let enabled = expect_bool(Attribute::SceneLoop, value)?;
        Ok(vec![Command::write(
            ENVELOPE.encode(OP_SCENE_LOOP, &[u8::from(enabled)])?,
        )])
    }

    fn decode_channel(number: u8, record: &[u8], totals: &mut MasterTotals) -> ChannelReport {
        let power = record[0] != 0;
        let effect = record[1];
        let level = record[3];
        totals.channels = number;
        totals.powered |= power;

        let mut status = Status::new()
            .with(Attribute::Power, power)
            .with(Attribute::EffectNumber, effect);
        status.set(
            Attribute::ChipOrder,
            chips::name(&chips::RGB_ORDERS, record[2]).map(Value::from),
        );

        if let Some(fx) = catalog().get(effect) {
            status.set(Attribute::Effect, Some(Value::from(fx.name.as_ref())));
            status.set(Attribute::EffectType, Some(Value::from(fx.kind.as_str())));
            if fx.speedable {
                status.set(Attribute::EffectSpeed, Some(Value::from(record[4])));
            }
            if fx.sizeable {
                let length = u16::from_be_bytes([record[5], record[6]]);
                status.set(Attribute::EffectLength, Some(Value::from(length)));
            }
            if fx.directional {
                status.set(Attribute::EffectDirection, Some(Value::from(record[7] != 0)));
            }
            if fx.colorable {
                status.set(
                    Attribute::RgbColor,
                    Some(Value::from([record[8], record[9], record[10]])),
                );
            }
            if fx.kind == EffectKind::Sound {
                totals.level += 255;
            } else {
                status.set(Attribute::Brightness, Some(Value::from(level)));
                totals.level += u32::from(level);
            }
        }

        ChannelReport::replace(number, status)
    }
}

impl ModelDescriptor for BanlanX {
    fn name(&self) -> &str {
        self.name
    }

    fn code(&self) -> u8 {
        self.code
    }

    fn manufacturer(&self) -> &str {
        "SPLED (BanlanX)"
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn channels(&self) -> u8 {
        self.channels
    }

    fn master_channel(&self) -> bool {
        true
    }

    fn matches(&self, advertisement: &Advertisement) -> bool {
        advertisement
            .manufacturer(MANUFACTURER_ID)
            .is_some_and(|data| data.first() == Some(&self.code))
    }

    fn endpoints(&self) -> Endpoints {
        Endpoints::shared(Some(short_uuid(0xFFE0)), Endpoint::short(0xFFE1))
    }

    fn framing(&self) -> Framing {
        Framing::Long(LongForm {
            magic: STATUS_MAGIC,
        })
    }

    fn state_query(&self) -> Result<Vec<Command>> {
        Ok(vec![Command::write(ENVELOPE.encode(OP_QUERY, &[])?)])
    }

    fn capabilities(&self, channel: u8) -> BTreeSet<Attribute> {
        let master = [
            Attribute::Power,
            Attribute::Brightness,
            Attribute::RgbColor,
            Attribute::AudioInput,
            Attribute::Sensitivity,
            Attribute::Scene,
            Attribute::SceneLoop,
        ];
        let segment = [
            Attribute::Power,
            Attribute::Brightness,
            Attribute::RgbColor,
            Attribute::Effect,
            Attribute::EffectSpeed,
            Attribute::EffectLength,
            Attribute::EffectDirection,
            Attribute::ChipOrder,
        ];
        if channel == 0 {
            master.into_iter().collect()
        } else {
            segment.into_iter().collect()
        }
    }

    fn encode(&self, view: &ChannelView, attribute: Attribute, value: &Value) -> Result<Vec<Command>> {
        self.attributes.encode(self, view, attribute, value)
    }

    fn options(&self, view: &ChannelView, attribute: Attribute) -> Option<Vec<String>> {
        self.attributes.options(self, view, attribute)
    }

    fn effect_catalog(&self, view: &ChannelView) -> Option<EffectCatalog> {
        (view.number != 0).then(catalog)
    }

    fn decode(&self, payload: &[u8], _context: Option<&Context>) -> Result<StatusReport> {
        let mut data = payload;
        let mut totals = MasterTotals::default();
        let mut channels = Vec::with_capacity(usize::from(self.channels) + 1);

        while data.len() > CHANNEL_RECORD_LEN && totals.channels < self.channels {
            let (record, rest) = data.split_at(CHANNEL_RECORD_LEN);
            tracing::trace!("channel {}: {}", totals.channels + 1, hex::encode(record));
            channels.push(Self::decode_channel(totals.channels + 1, record, &mut totals));
            data = rest;
        }
        if totals.channels == 0 {
            return Err(Error::decode(format!(
                "status of {} bytes carries no channel record",
                payload.len()
            )));
        }

        let mut master = Status::new()
            .with(Attribute::Channels, totals.channels)
            .with(Attribute::Power, totals.powered)
            .with(Attribute::Brightness, (totals.level / u32::from(totals.channels)) as u8);

        if let Some((&gain, rest)) = data.split_first() {
            if totals.powered {
                master.set(Attribute::Sensitivity, Some(Value::from(gain)));
            }
            data = rest;
        }
        if let Some((&timers, rest)) = data.split_first() {
            data = rest;
            for _ in 0..timers {
                if data.len() < TIMER_RECORD_LEN {
                    break;
                }
                data = &data[TIMER_RECORD_LEN..];
            }
        }
        let mut triggers = 0;
        while data.len() >= TRIGGER_RECORD_LEN && triggers < MAX_TRIGGERS {
            data = &data[TRIGGER_RECORD_LEN..];
            triggers += 1;
        }
        if let Some(&auto) = data.first() {
            master.set(Attribute::SceneLoop, Some(Value::from(auto != 0)));
        }

        channels.insert(0, ChannelReport::replace(0, master));
        Ok(StatusReport::new(channels))
    }
}
