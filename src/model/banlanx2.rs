//! BanlanX v2 single-output SPI controllers: SP611E, SP617E, SP620E and SP621E.
//!
//! Commands use a header envelope without a channel mask:
//! ```text
//! ┌──────┬────────┬────────┬──────────┐
//! │ 0xA0 │ opcode │ length │  params  │
//! └──────┴────────┴────────┴──────────┘
//! ```
//! Status arrives as long-form notifications with magic `53 43`. The
//! reassembled payload starts with a fixed block of settings:
//! ```text
//! ┌───────┬──────┬────────┬───────┬───────┬───────┬────────┬─────┬─────┬─────┬───────┬──────┐
//! │ power │ mode │ effect │ order │ level │ speed │ length │  r  │  g  │  b  │ input │ gain │
//! └───────┴──────┴────────┴───────┴───────┴───────┴────────┴─────┴─────┴─────┴───────┴──────┘
//! ```
//! Timers follow. RGBW models end the payload with cool and warm white.

use std::collections::BTreeSet;
use std::sync::LazyLock;

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

/// Company ids carried in the advertisement.
pub const MANUFACTURER_IDS: [u16; 2] = [20563, 5053];

const ENVELOPE: Envelope = Envelope::Header(HeaderForm {
    magic: &[0xA0],
    key: None,
    flags: &[],
    length: LengthField::U8,
});

const STATUS_MAGIC: [u8; 2] = [0x53, 0x43];

const OP_POWER: u8 = 0x62;
const OP_EFFECT: u8 = 0x63;
const OP_CHIP_ORDER: u8 = 0x64;
const OP_BRIGHTNESS: u8 = 0x66;
const OP_SPEED: u8 = 0x67;
const OP_LENGTH: u8 = 0x68;
const OP_COLOR: u8 = 0x69;
const OP_LIGHT_MODE: u8 = 0x6A;
const OP_SENSITIVITY: u8 = 0x6B;
const OP_AUDIO_INPUT: u8 = 0x6C;
const OP_QUERY: u8 = 0x70;
const OP_WHITE: u8 = 0x76;

/// Settings block that precedes the timers.
const STATUS_LEN: usize = 23;

const MAX_SPEED: i64 = 10;
const MAX_LENGTH: i64 = 150;
const MAX_SENSITIVITY: i64 = 16;

const EFFECT_SOLID: u8 = 0xBE;
const EFFECT_WHITE: u8 = 0xBF;

const MODE_SINGLE: u8 = 0x00;
const MODE_CYCLE_DYNAMIC: u8 = 0x01;
const MODE_CYCLE_SOUND: u8 = 0x02;

const LIGHT_MODES: [&str; 3] = ["Single FX", "Cycle Dynamic FX's", "Cycle Sound FX's"];
const AUDIO_INPUTS: [&str; 3] = ["Int. Mic", "Player", "Ext. Mic"];

static COLORS: [&str; 7] = ["Red", "Green", "Blue", "Yellow", "Cyan", "Purple", "White"];

static SOUND_EFFECTS: [Effect; 18] = [
    Effect::sound(0xC9, "Sound - Full Color Rhythm Spectrum"),
    Effect::sound(0xCA, "Sound - Single Color Rhythm Spectrum").colorable(),
    Effect::sound(0xCB, "Sound - Full Color Rhythm Stars"),
    Effect::sound(0xCC, "Sound - Single Color Rhythm Stars").colorable(),
    Effect::sound(0xCD, "Sound - Gradient Energy"),
    Effect::sound(0xCE, "Sound - Single Color Energy").colorable(),
    Effect::sound(0xCF, "Sound - Gradient Pulse"),
    Effect::sound(0xD0, "Sound - Single Color Pulse").colorable(),
    Effect::sound(0xD1, "Sound - Full Color Ejection Forward"),
    Effect::sound(0xD2, "Sound - Single Color Ejection Forward").colorable(),
    Effect::sound(0xD3, "Sound - Full Color Ejection Backward"),
    Effect::sound(0xD4, "Sound - Single Color Ejection Backward").colorable(),
    Effect::sound(0xD5, "Sound - Full Color VuMeter"),
    Effect::sound(0xD6, "Sound - Single Color VuMeter").colorable(),
    Effect::sound(0xD7, "Sound - Love & Peace"),
    Effect::sound(0xD8, "Sound - Christmas"),
    Effect::sound(0xD9, "Sound - Heartbeat"),
    Effect::sound(0xDA, "Sound - Party"),
];

/// Dynamic effects, numbered from 0x01 in table order.
fn dynamic_names() -> Vec<String> {
    let single = |suffix: &'static str| COLORS.iter().map(move |c| format!("{c} {suffix}"));
    let pairs = |suffix: &'static str| {
        COLORS.iter().enumerate().flat_map(move |(i, a)| {
            COLORS[i + 1..].iter().map(move |b| format!("{a}/{b} {suffix}"))
        })
    };

    let mut names: Vec<String> = ["Rainbow", "Rainbow Meteor", "Rainbow Stars", "Rainbow Spin"]
        .into_iter()
        .map(String::from)
        .collect();
    names.extend(
        ["Red/Yellow", "Red/Purple", "Green/Yellow", "Green/Cyan", "Blue/Purple", "Blue/Cyan"]
            .iter()
            .map(|pair| format!("{pair} Fire")),
    );
    names.extend(single("Comet"));
    names.extend(single("Meteor"));
    names.extend(pairs("Gradual Snake"));
    names.extend(single("Wave"));
    names.extend(pairs("Wave"));
    names.extend(single("Stars"));
    names.extend(COLORS[..6].iter().map(|c| format!("{c} Background Stars")));
    names.extend(COLORS.iter().map(|c| format!("{c}/White Background Stars")));
    names.extend(single("Breath"));
    names.extend(single("Stacking"));
    names.push("Full Color Stack".into());
    names.extend(COLORS.windows(2).map(|w| format!("{} to {} Stack", w[0], w[1])));
    names.extend(
        ["Red/Blue/White", "Green/Yellow/White", "Red/Green/White", "Red/Yellow", "Red/White", "Green/White"]
            .iter()
            .map(|c| format!("{c} Snake")),
    );
    names.extend(single("Comet Spin"));
    names.extend(single("Dot Spin"));
    names.extend(single("Segment Spin"));
    names.push("Gradient".into());
    names
}

fn effects(white: bool, sound: bool) -> Vec<Effect> {
    let mut effects = vec![Effect::solid(EFFECT_SOLID, "Solid Color")];
    if white {
        effects.push(Effect::solid(EFFECT_WHITE, "Solid White").uncolored());
    }
    effects.extend(
        dynamic_names()
            .into_iter()
            .zip(1u8..)
            .map(|(name, number)| Effect::dynamic(number, "").sizeable().renamed(name)),
    );
    if sound {
        effects.extend(SOUND_EFFECTS.iter().cloned());
    }
    effects
}

static RGB: LazyLock<Vec<Effect>> = LazyLock::new(|| effects(false, false));
static RGB_SOUND: LazyLock<Vec<Effect>> = LazyLock::new(|| effects(false, true));
static RGBW_SOUND: LazyLock<Vec<Effect>> = LazyLock::new(|| effects(true, true));

/// BanlanX v2 descriptor.
#[derive(Debug)]
pub struct BanlanX2 {
    name: &'static str,
    signature: [u8; 2],
    rgbw: bool,
    microphone: bool,
    attributes: AttributeMap<Self>,
}

impl BanlanX2 {
    /// SP611E RGB controller with microphone.
    #[must_use]
    pub fn sp611e() -> Self {
        Self::new("SP611E", [0x04, 0x10], false, true)
    }

    /// SP617E RGBW controller with microphone.
    #[must_use]
    pub fn sp617e() -> Self {
        Self::new("SP617E", [0x17, 0x10], true, true)
    }

    /// SP620E USB powered RGB controller with microphone.
    #[must_use]
    pub fn sp620e() -> Self {
        Self::new("SP620E", [0x1B, 0x10], false, true)
    }

    /// SP621E mini RGB controller, no audio.
    #[must_use]
    pub fn sp621e() -> Self {
        Self::new("SP621E", [0x0D, 0x00], false, false)
    }

    fn new(name: &'static str, signature: [u8; 2], rgbw: bool, microphone: bool) -> Self {
        let mut attributes = AttributeMap::new()
            .with(Attribute::Power, Self::encode_power)
            .with(Attribute::Brightness, Self::encode_brightness)
            .with(Attribute::RgbColor, Self::encode_rgb)
            .with_list(Attribute::Effect, Self::encode_effect, Self::list_effects)
            .with(Attribute::EffectSpeed, Self::encode_speed)
            .with(Attribute::EffectLength, Self::encode_length)
            .with_list(Attribute::ChipOrder, Self::encode_chip_order, Self::list_chip_orders);
        if rgbw {
            attributes = attributes
                .with(Attribute::White, Self::encode_white)
                .with(Attribute::RgbwColor, Self::encode_rgbw);
        }
        attributes = if microphone {
            attributes
                .with_list(Attribute::LightMode, Self::encode_light_mode, Self::list_light_modes)
                .with_list(Attribute::AudioInput, Self::encode_audio_input, Self::list_audio_inputs)
                .with(Attribute::Sensitivity, Self::encode_sensitivity)
        } else {
            attributes.with(Attribute::EffectLoop, Self::encode_loop)
        };
        Self {
            name,
            signature,
            rgbw,
            microphone,
            attributes,
        }
    }

    fn catalog(&self) -> EffectCatalog {
        match (self.rgbw, self.microphone) {
            (true, _) => EffectCatalog::new(RGBW_SOUND.as_slice()),
            (false, true) => EffectCatalog::new(RGB_SOUND.as_slice()),
            (false, false) => EffectCatalog::new(RGB.as_slice()),
        }
    }

    fn frame(opcode: u8, params: &[u8]) -> Result<Command> {
        Ok(Command::write(ENVELOPE.encode(opcode, params)?))
    }

    fn current_effect(view: &ChannelView) -> Option<u8> {
        view.status
            .get_int(Attribute::EffectNumber)
            .and_then(|v| u8::try_from(v).ok())
    }

    fn orders(&self) -> &'static [&'static str] {
        if self.rgbw {
            &chips::RGBW_ORDERS
        } else {
            &chips::RGB_ORDERS
        }
    }

    fn encode_power(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let on = expect_bool(Attribute::Power, value)?;
        Ok(vec![Self::frame(OP_POWER, &[u8::from(on)])?])
    }

    fn encode_brightness(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let level = expect_u8(Attribute::Brightness, value)?;
        // Solid white is dimmed through the white channel
        if Self::current_effect(view) == Some(EFFECT_WHITE) {
            return Ok(vec![Self::frame(OP_WHITE, &[level, 0x00])?]);
        }
        Ok(vec![Self::frame(OP_BRIGHTNESS, &[level])?])
    }

    fn encode_white(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let white = expect_u8(Attribute::White, value)?;
        let mut frames = Vec::with_capacity(2);
        if Self::current_effect(view) != Some(EFFECT_WHITE) {
            frames.push(Self::frame(OP_EFFECT, &[EFFECT_WHITE])?);
        }
        frames.push(Self::frame(OP_WHITE, &[white, 0x00])?);
        Ok(frames)
    }

    fn rgb_frames(&self, view: &ChannelView, [r, g, b]: [u8; 3]) -> Result<Vec<Command>> {
        let mut frames = Vec::with_capacity(2);
        let colorable = Self::current_effect(view)
            .and_then(|number| self.catalog().get(number))
            .is_some_and(|fx| fx.colorable);
        if !colorable {
            frames.push(Self::frame(OP_EFFECT, &[EFFECT_SOLID])?);
        }
        let level = view
            .status
            .get_int(Attribute::Brightness)
            .and_then(|v| u8::try_from(v).ok())
            .unwrap_or(0xFF);
        frames.push(Self::frame(OP_COLOR, &[r, g, b, level])?);
        Ok(frames)
    }

    fn encode_rgb(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let rgb = expect_rgb(Attribute::RgbColor, value)?;
        self.rgb_frames(view, rgb)
    }

    fn encode_rgbw(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let [r, g, b, w] = value
            .as_rgbw()
            .ok_or_else(|| Error::invalid(Attribute::RgbwColor, format!("expected RGBW, got {value}")))?;
        let mut frames = self.rgb_frames(view, [r, g, b])?;
        frames.push(Self::frame(OP_WHITE, &[w, 0x00])?);
        Ok(frames)
    }

    fn encode_effect(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let catalog = self.catalog();
        let effect = match value {
            Value::Text(name) => catalog.by_name(name),
            other => other
                .as_int()
                .and_then(|v| u8::try_from(v).ok())
                .and_then(|v| catalog.get(v)),
        }
        .ok_or_else(|| Error::invalid(Attribute::Effect, format!("unknown effect {value}")))?;
        Ok(vec![Self::frame(OP_EFFECT, &[effect.number])?])
    }

    fn list_effects(&self, _: &ChannelView) -> Option<Vec<String>> {
        Some(self.catalog().names())
    }

    fn encode_speed(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let speed = expect_ranged(Attribute::EffectSpeed, value, 1, MAX_SPEED)?;
        Ok(vec![Self::frame(OP_SPEED, &[speed as u8])?])
    }

    fn encode_length(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let length = expect_ranged(Attribute::EffectLength, value, 1, MAX_LENGTH)?;
        Ok(vec![Self::frame(OP_LENGTH, &[length as u8])?])
    }

    fn encode_light_mode(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let mode = expect_option(Attribute::LightMode, value, &LIGHT_MODES)?;
        Ok(vec![Self::frame(OP_LIGHT_MODE, &[mode])?])
    }

    fn list_light_modes(&self, _: &ChannelView) -> Option<Vec<String>> {
        Some(chips::names(&LIGHT_MODES))
    }

    fn encode_loop(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let mode = if expect_bool(Attribute::EffectLoop, value)? {
            MODE_CYCLE_DYNAMIC
        } else {
            MODE_SINGLE
        };
        Ok(vec![Self::frame(OP_LIGHT_MODE, &[mode])?])
    }

    fn encode_sensitivity(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let gain = expect_ranged(Attribute::Sensitivity, value, 1, MAX_SENSITIVITY)?;
        Ok(vec![Self::frame(OP_SENSITIVITY, &[gain as u8])?])
    }

    fn encode_audio_input(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let input = expect_option(Attribute::AudioInput, value, &AUDIO_INPUTS)?;
        Ok(vec![Self::frame(OP_AUDIO_INPUT, &[input])?])
    }

    fn list_audio_inputs(&self, _: &ChannelView) -> Option<Vec<String>> {
        Some(chips::names(&AUDIO_INPUTS))
    }

    fn encode_chip_order(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let order = expect_option(Attribute::ChipOrder, value, self.orders())?;
        Ok(vec![Self::frame(OP_CHIP_ORDER, &[order])?])
    }

    fn list_chip_orders(&self, _: &ChannelView) -> Option<Vec<String>> {
        Some(chips::names(self.orders()))
    }
}

impl ModelDescriptor for BanlanX2 {
    fn name(&self) -> &str {
        self.name
    }

    fn code(&self) -> u8 {
        self.signature[0]
    }

    fn manufacturer(&self) -> &str {
        "SPLED (BanlanX)"
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn matches(&self, advertisement: &Advertisement) -> bool {
        MANUFACTURER_IDS.iter().any(|id| {
            advertisement
                .manufacturer(*id)
                .is_some_and(|data| data.starts_with(&self.signature))
        })
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
        Ok(vec![Self::frame(OP_QUERY, &[])?])
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
        Some(self.catalog())
    }

    fn decode(&self, payload: &[u8], _context: Option<&Context>) -> Result<StatusReport> {
        if payload.len() < STATUS_LEN {
            return Err(Error::decode(format!(
                "expected at least {STATUS_LEN} status bytes, got {}",
                payload.len()
            )));
        }
        let mode = payload[1];
        let effect = payload[2];
        let level = payload[4];

        let mut status = Status::new()
            .with(Attribute::Power, payload[0] == 0x01)
            .with(Attribute::LightModeNumber, mode)
            .with(Attribute::EffectLoop, mode != MODE_SINGLE)
            .with(Attribute::Brightness, level)
            .with(Attribute::RgbColor, [payload[7], payload[8], payload[9]]);
        status.set(
            Attribute::ChipOrder,
            chips::name(self.orders(), payload[3]).map(Value::from),
        );
        if self.microphone {
            status.set(
                Attribute::LightMode,
                LIGHT_MODES.get(usize::from(mode)).copied().map(Value::from),
            );
        }
        if self.rgbw && payload.len() >= STATUS_LEN + 2 {
            status.set(Attribute::White, Some(Value::from(payload[payload.len() - 2])));
        }

        let kind = match mode {
            MODE_SINGLE => {
                status.set(Attribute::EffectNumber, Some(Value::from(effect)));
                let fx = self.catalog().get(effect);
                status.set(Attribute::Effect, fx.map(|fx| Value::from(fx.name.as_ref())));
                fx.map(|fx| fx.kind)
            }
            MODE_CYCLE_DYNAMIC => Some(EffectKind::Dynamic),
            MODE_CYCLE_SOUND => Some(EffectKind::Sound),
            other => {
                tracing::debug!("unknown light mode {:#04x}", other);
                None
            }
        };
        status.set(Attribute::EffectType, kind.map(|k| Value::from(k.as_str())));
        match kind {
            Some(EffectKind::Dynamic) => {
                status.set(Attribute::EffectSpeed, Some(Value::from(payload[5])));
                status.set(Attribute::EffectLength, Some(Value::from(payload[6])));
            }
            Some(EffectKind::Sound) => {
                status.set(Attribute::Sensitivity, Some(Value::from(payload[11])));
                status.set(
                    Attribute::AudioInput,
                    AUDIO_INPUTS.get(usize::from(payload[10])).copied().map(Value::from),
                );
            }
            _ => {}
        }

        Ok(StatusReport::new(vec![ChannelReport::replace(0, status)]))
    }
}
