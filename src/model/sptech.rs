//! SPTech SP63xE BLE controllers and the SP530E network controller.
//!
//! Both transports share one frame layout and differ in magic and length
//! width:
//! ```text
//! BLE  ┌──────┬─────┬─────┬──────┬──────┬─────┬─────────┐
//!      │ 0x53 │ cmd │ key │ 0x01 │ 0x00 │ len │ payload │
//!      └──────┴─────┴─────┴──────┴──────┴─────┴─────────┘
//! NET  ┌────────────┬─────┬─────┬──────┬──────┬──────────┬─────────┐
//!      │ "SPTECH\0" │ cmd │ key │ 0x00 │ 0x00 │ len BE16 │ payload │
//!      └────────────┴─────┴─────┴──────┴──────┴──────────┴─────────┘
//! ```
//! A status payload opens with a flag byte selecting the width of the chunk
//! size fields (0 for one byte, 1 for two), followed by `[type, size, data]`
//! chunks. Chunk 1 carries device information, chunk 2 the light settings
//! and chunk 3 the settings with a two byte prefix.
//!
//! What a device can do depends on its configured light type, reported in
//! chunk 1 and kept as the master [`Context`].

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::channel::{ChannelView, Status};
use crate::error::{Error, Result};
use crate::model::chips;
use crate::model::{
    Advertisement, AttributeMap, ChannelReport, Command, Context, Effect, EffectCatalog,
    EffectKind, Endpoints, ModelDescriptor, StatusReport, expect_bool, expect_option,
    expect_ranged, expect_rgb, expect_u8,
};
use crate::protocol::frame::{Envelope, Framing, HeaderForm, LengthField, PrefixedForm};
use crate::transport::{Endpoint, short_uuid};
use crate::types::{Attribute, TransportKind, Value};

/// Company id carried in the advertisement.
pub const MANUFACTURER_ID: u16 = 20563;

/// TCP port of the network controller.
pub const NET_PORT: u16 = 8587;

const BLE_MAGIC: &[u8] = &[0x53];
const NET_MAGIC: &[u8] = b"SPTECH\0";

const BLE_HEADER: HeaderForm = HeaderForm {
    magic: BLE_MAGIC,
    key: Some(0x00),
    flags: &[0x01, 0x00],
    length: LengthField::U8,
};

const NET_HEADER: HeaderForm = HeaderForm {
    magic: NET_MAGIC,
    key: Some(0x00),
    flags: &[0x00, 0x00],
    length: LengthField::U16,
};

const OP_QUERY: u8 = 0x02;
const OP_ONOFF: u8 = 0x08;
const OP_ON_POWER: u8 = 0x0B;
const OP_POWER: u8 = 0x50;
const OP_LEVEL: u8 = 0x51;
const OP_STATIC_COLOR: u8 = 0x52;
const OP_LIGHT_MODE: u8 = 0x53;
const OP_SPEED: u8 = 0x54;
const OP_LENGTH: u8 = 0x55;
const OP_DIRECTION: u8 = 0x56;
const OP_EFFECT_COLOR: u8 = 0x57;
const OP_LOOP: u8 = 0x58;
const OP_AUDIO_INPUT: u8 = 0x59;
const OP_SENSITIVITY: u8 = 0x5A;
const OP_PLAY: u8 = 0x5D;
const OP_LIGHT_TYPE: u8 = 0x6A;
const OP_CHIP_ORDER: u8 = 0x6B;

const CHUNK_INFO: u8 = 0x01;
const CHUNK_SETTINGS: u8 = 0x02;
const CHUNK_SETTINGS_EXT: u8 = 0x03;
const INFO_LEN: usize = 17;
const SETTINGS_LEN: usize = 24;

const MAX_SPEED: i64 = 10;
const MAX_LENGTH: i64 = 150;
const MAX_SENSITIVITY: i64 = 16;
const MIN_ONOFF_PIXELS: i64 = 1;
const MAX_ONOFF_PIXELS: i64 = 600;

const MODE_STATIC_COLOR: u8 = 0x01;
const MODE_STATIC_WHITE: u8 = 0x02;
const MODE_DYNAMIC_COLOR: u8 = 0x03;
const MODE_DYNAMIC_WHITE: u8 = 0x04;
const MODE_SOUND_COLOR: u8 = 0x05;
const MODE_SOUND_WHITE: u8 = 0x06;
const MODE_CUSTOM_SOLID: u8 = 0x07;
const MODE_CUSTOM_GRADIENT: u8 = 0x08;

const MODES: [(u8, &str); 8] = [
    (MODE_STATIC_COLOR, "Static Color"),
    (MODE_STATIC_WHITE, "Static White"),
    (MODE_DYNAMIC_COLOR, "Dynamic Color"),
    (MODE_DYNAMIC_WHITE, "Dynamic White"),
    (MODE_SOUND_COLOR, "Sound - Color"),
    (MODE_SOUND_WHITE, "Sound - White"),
    (MODE_CUSTOM_SOLID, "Custom Solid"),
    (MODE_CUSTOM_GRADIENT, "Custom Gradient"),
];

const ONOFF_EFFECTS: [(u8, &str); 4] = [
    (0x01, "Flow Forward"),
    (0x02, "Flow Backward"),
    (0x03, "Gradient"),
    (0x04, "Stars"),
];

const ONOFF_SPEEDS: [(u8, &str); 3] = [(0x01, "Slow"), (0x02, "Medium"), (0x03, "Fast")];

const ON_POWER_STATES: [&str; 3] = ["Light Off", "Light On", "Last state"];

const AUDIO_INPUTS: [&str; 3] = ["Int. Mic", "Player", "Ext. Mic"];

const RGBW_ORDERS: [&str; 24] = [
    "RGBW", "RBGW", "GRBW", "GBRW", "BRGW", "BGRW", "WRGB", "WRBG", "WGRB", "WGBR", "WBRG",
    "WBGR", "RWGB", "RWBG", "GWRB", "GWBR", "BWRG", "BWGR", "RGWB", "RBWG", "GRWB", "GBWR",
    "BRWG", "BGWR",
];

const fn is_static(mode: u8) -> bool {
    matches!(mode, MODE_STATIC_COLOR | MODE_STATIC_WHITE)
}

const fn is_dynamic(mode: u8) -> bool {
    matches!(mode, MODE_DYNAMIC_COLOR | MODE_DYNAMIC_WHITE)
}

const fn is_sound(mode: u8) -> bool {
    matches!(mode, MODE_SOUND_COLOR | MODE_SOUND_WHITE)
}

const fn is_custom(mode: u8) -> bool {
    matches!(mode, MODE_CUSTOM_SOLID | MODE_CUSTOM_GRADIENT)
}

const fn is_white(mode: u8) -> bool {
    matches!(mode, MODE_STATIC_WHITE | MODE_DYNAMIC_WHITE | MODE_SOUND_WHITE)
}

const fn is_color(mode: u8) -> bool {
    matches!(
        mode,
        MODE_STATIC_COLOR
            | MODE_DYNAMIC_COLOR
            | MODE_SOUND_COLOR
            | MODE_CUSTOM_SOLID
            | MODE_CUSTOM_GRADIENT
    )
}

const fn loops(mode: u8) -> bool {
    is_dynamic(mode) || is_sound(mode)
}

static SOLID: [Effect; 1] = [Effect::solid(0x01, "Solid")];

static PWM_DYNAMIC_WHITE: [Effect; 3] = [
    Effect::dynamic(0x01, "White Color Breath").colorable(),
    Effect::dynamic(0x02, "White Color Strobe").colorable(),
    Effect::dynamic(0x03, "White Color Heart Beat").colorable(),
];

static PWM_SOUND_WHITE: [Effect; 1] = [Effect::sound(0x01, "Sound - White Color Music Breath").colorable()];

static PWM_DYNAMIC_COLOR: [Effect; 12] = [
    Effect::dynamic(0x01, "Seven Color Jump"),
    Effect::dynamic(0x02, "Seven Color Breath"),
    Effect::dynamic(0x03, "Seven Color Strobe"),
    Effect::dynamic(0x04, "Seven Color Heartbeat"),
    Effect::dynamic(0x05, "Seven Color Gradient"),
    Effect::dynamic(0x06, "Red Breath"),
    Effect::dynamic(0x07, "Green Breath"),
    Effect::dynamic(0x08, "Blue Breath"),
    Effect::dynamic(0x09, "Yellow Breath"),
    Effect::dynamic(0x0A, "Cyan Breath"),
    Effect::dynamic(0x0B, "Purple Breath"),
    Effect::dynamic(0x0C, "White Breath"),
];

static PWM_SOUND_COLOR: [Effect; 3] = [
    Effect::sound(0x00, "Sound - Music Breath"),
    Effect::sound(0x01, "Sound - Music Jump"),
    Effect::sound(0x02, "Sound - Music Mono Breath").colorable(),
];

static PWM_CUSTOM: [Effect; 3] = [
    Effect::dynamic(0x01, "Jump"),
    Effect::dynamic(0x02, "Breath"),
    Effect::dynamic(0x03, "Strobe"),
];

static SPI_DYNAMIC_COLOR: [Effect; 29] = [
    Effect::dynamic(0x01, "Rainbow").sizeable().directional().pausable(),
    Effect::dynamic(0x02, "Rainbow Meteor").sizeable().directional(),
    Effect::dynamic(0x03, "Rainbow Comet").sizeable().directional(),
    Effect::dynamic(0x04, "Rainbow Segment").sizeable().directional(),
    Effect::dynamic(0x05, "Rainbow Wave").sizeable().directional(),
    Effect::dynamic(0x06, "Rainbow Jump"),
    Effect::dynamic(0x07, "Rainbow Stars"),
    Effect::dynamic(0x08, "Rainbow Spin").sizeable(),
    Effect::dynamic(0x09, "Red/Yellow Fire").sizeable().directional(),
    Effect::dynamic(0x0A, "Red/Purple Fire").sizeable().directional(),
    Effect::dynamic(0x0B, "Green/Yellow Fire").sizeable().directional(),
    Effect::dynamic(0x0C, "Green/Cyan Fire").sizeable().directional(),
    Effect::dynamic(0x0D, "Blue/Purple Fire").sizeable().directional(),
    Effect::dynamic(0x0E, "Blue/Cyan Fire").sizeable().directional(),
    Effect::dynamic(0x0F, "Red Comet").sizeable().directional().pausable(),
    Effect::dynamic(0x10, "Green Comet").sizeable().directional().pausable(),
    Effect::dynamic(0x11, "Blue Comet").sizeable().directional().pausable(),
    Effect::dynamic(0x12, "Yellow Comet").sizeable().directional().pausable(),
    Effect::dynamic(0x13, "Cyan Comet").sizeable().directional().pausable(),
    Effect::dynamic(0x14, "Purple Comet").sizeable().directional().pausable(),
    Effect::dynamic(0x15, "White Comet").sizeable().directional().pausable(),
    Effect::dynamic(0x16, "Red Meteor").sizeable().directional(),
    Effect::dynamic(0x17, "Green Meteor").sizeable().directional(),
    Effect::dynamic(0x18, "Blue Meteor").sizeable().directional(),
    Effect::dynamic(0x19, "Yellow Meteor").sizeable().directional(),
    Effect::dynamic(0x1A, "Cyan Meteor").sizeable().directional(),
    Effect::dynamic(0x1B, "Purple Meteor").sizeable().directional(),
    Effect::dynamic(0x1C, "White Meteor").sizeable().directional(),
    Effect::dynamic(0x92, "Gradient"),
];

static SPI_DYNAMIC_WHITE: [Effect; 10] = [
    Effect::dynamic(0x01, "White Color Breath").colorable().directional(),
    Effect::dynamic(0x02, "White Color Stars").colorable().directional(),
    Effect::dynamic(0x03, "White Color Meteor").colorable().sizeable().directional(),
    Effect::dynamic(0x04, "White Color Comet Spin").colorable().sizeable().directional(),
    Effect::dynamic(0x05, "White Color Dot Spin").colorable().sizeable().directional().pausable(),
    Effect::dynamic(0x06, "White Color Segment Spin").colorable().sizeable().directional().pausable(),
    Effect::dynamic(0x07, "White Color Chasing Dots").colorable().sizeable().directional().pausable(),
    Effect::dynamic(0x08, "White Color Comet").colorable().sizeable().directional().pausable(),
    Effect::dynamic(0x09, "White Color Wave").colorable().sizeable().directional().pausable(),
    Effect::dynamic(0x0A, "White Color Stacking").colorable().sizeable().directional(),
];

static SPI_SOUND_COLOR: [Effect; 18] = [
    Effect::sound(0x01, "Sound - Full Color Rhythm Spectrum"),
    Effect::sound(0x02, "Sound - Single Color Rhythm Spectrum").colorable(),
    Effect::sound(0x03, "Sound - Full Color Rhythm Stars"),
    Effect::sound(0x04, "Sound - Single Color Rhythm Stars").colorable(),
    Effect::sound(0x05, "Sound - Gradient Energy").sizeable(),
    Effect::sound(0x06, "Sound - Single Color Energy").colorable().sizeable(),
    Effect::sound(0x07, "Sound - Gradient Pulse"),
    Effect::sound(0x08, "Sound - Single Color Pulse").colorable(),
    Effect::sound(0x09, "Sound - Full Color Ejection Forward").sizeable(),
    Effect::sound(0x0A, "Sound - Single Color Ejection Forward").colorable().sizeable(),
    Effect::sound(0x0B, "Sound - Full Color Ejection Backward").sizeable(),
    Effect::sound(0x0C, "Sound - Single Color Ejection Backward").colorable().sizeable(),
    Effect::sound(0x0D, "Sound - Full Color VuMeter").sizeable(),
    Effect::sound(0x0E, "Sound - Single Color VuMeter").colorable().sizeable(),
    Effect::sound(0x0F, "Sound - Love & Peace"),
    Effect::sound(0x10, "Sound - Christmas"),
    Effect::sound(0x11, "Sound - Heartbeat"),
    Effect::sound(0x12, "Sound - Party"),
];

static SPI_SOUND_WHITE: [Effect; 5] = [
    Effect::sound(0x01, "Sound - White Color Music Blink").colorable(),
    Effect::sound(0x02, "Sound - White Color Music Force").colorable().sizeable(),
    Effect::sound(0x03, "Sound - White Color Music Hits").colorable(),
    Effect::sound(0x04, "Sound - White Color Music Eject Forward").colorable().directional(),
    Effect::sound(0x05, "Sound - White Color Music Eject Backward").colorable().directional(),
];

static SPI_CUSTOM: [Effect; 18] = [
    Effect::solid(0x01, "Static").uncolored(),
    Effect::dynamic(0x02, "Chase Forward"),
    Effect::dynamic(0x03, "Chase Backward"),
    Effect::dynamic(0x04, "Chase Middle to Out"),
    Effect::dynamic(0x05, "Chase Out to Middle"),
    Effect::dynamic(0x06, "Twinkle"),
    Effect::dynamic(0x07, "Fade"),
    Effect::dynamic(0x08, "Comet Forward"),
    Effect::dynamic(0x09, "Comet Backward"),
    Effect::dynamic(0x0A, "Comet Middle to Out"),
    Effect::dynamic(0x0B, "Comet Out to Middle"),
    Effect::dynamic(0x0C, "Wave Forward"),
    Effect::dynamic(0x0D, "Wave Backward"),
    Effect::dynamic(0x0E, "Wave Middle to Out"),
    Effect::dynamic(0x0F, "Wave Out to Middle"),
    Effect::dynamic(0x10, "Strobe"),
    Effect::dynamic(0x11, "Solid Fade"),
    Effect::dynamic(0x12, "Full Strobe"),
];

/// Output configuration a controller can be switched between.
#[derive(Debug)]
pub struct LightType {
    /// Display name.
    pub name: &'static str,
    /// Drives addressable pixels.
    pub spi: bool,
    /// Has colour channels.
    pub hue: bool,
    /// Has a white channel.
    pub white: bool,
    /// Wire orders, empty when fixed.
    pub orders: &'static [&'static str],
    /// Light modes with their effect tables.
    pub modes: &'static [(u8, &'static [Effect])],
}

impl LightType {
    /// Effects of a light mode, if the type offers it.
    #[must_use]
    pub fn effects(&self, mode: u8) -> Option<EffectCatalog> {
        self.modes
            .iter()
            .find(|(m, _)| *m == mode)
            .map(|(_, effects)| EffectCatalog::new(effects))
    }

    /// Returns true if the type offers the light mode.
    #[must_use]
    pub fn has_mode(&self, mode: u8) -> bool {
        self.modes.iter().any(|(m, _)| *m == mode)
    }

    fn mode_names(&self) -> Vec<String> {
        self.modes
            .iter()
            .filter_map(|(mode, _)| keyed_name(&MODES, *mode))
            .map(str::to_string)
            .collect()
    }

    fn resolve_mode(&self, value: &Value) -> Result<u8> {
        let mode = expect_keyed(Attribute::LightMode, value, &MODES)?;
        if self.has_mode(mode) {
            Ok(mode)
        } else {
            Err(Error::invalid(
                Attribute::LightMode,
                format!("{value} is not offered by {}", self.name),
            ))
        }
    }
}

static PWM_MONO_MODES: [(u8, &[Effect]); 3] = [
    (MODE_STATIC_WHITE, &SOLID),
    (MODE_DYNAMIC_WHITE, &PWM_DYNAMIC_WHITE),
    (MODE_SOUND_WHITE, &PWM_SOUND_WHITE),
];

static PWM_RGB_MODES: [(u8, &[Effect]); 4] = [
    (MODE_STATIC_COLOR, &SOLID),
    (MODE_DYNAMIC_COLOR, &PWM_DYNAMIC_COLOR),
    (MODE_SOUND_COLOR, &PWM_SOUND_COLOR),
    (MODE_CUSTOM_SOLID, &PWM_CUSTOM),
];

static SPI_RGB_MODES: [(u8, &[Effect]); 4] = [
    (MODE_STATIC_COLOR, &SOLID),
    (MODE_DYNAMIC_COLOR, &SPI_DYNAMIC_COLOR),
    (MODE_SOUND_COLOR, &SPI_SOUND_COLOR),
    (MODE_CUSTOM_SOLID, &SPI_CUSTOM),
];

static SPI_RGBW_MODES: [(u8, &[Effect]); 7] = [
    (MODE_STATIC_COLOR, &SOLID),
    (MODE_STATIC_WHITE, &SOLID),
    (MODE_DYNAMIC_COLOR, &SPI_DYNAMIC_COLOR),
    (MODE_DYNAMIC_WHITE, &SPI_DYNAMIC_WHITE),
    (MODE_SOUND_COLOR, &SPI_SOUND_COLOR),
    (MODE_SOUND_WHITE, &SPI_SOUND_WHITE),
    (MODE_CUSTOM_SOLID, &SPI_CUSTOM),
];

static PWM_MONO: LightType = LightType {
    name: "1 CH PWM - Single Color",
    spi: false,
    hue: false,
    white: true,
    orders: &[],
    modes: &PWM_MONO_MODES,
};

static PWM_RGB: LightType = LightType {
    name: "3 CH PWM - RGB",
    spi: false,
    hue: true,
    white: false,
    orders: &chips::RGB_ORDERS,
    modes: &PWM_RGB_MODES,
};

static SPI_RGB: LightType = LightType {
    name: "SPI - RGB",
    spi: true,
    hue: true,
    white: false,
    orders: &chips::RGB_ORDERS,
    modes: &SPI_RGB_MODES,
};

static SPI_RGBW: LightType = LightType {
    name: "SPI - RGBW",
    spi: true,
    hue: true,
    white: true,
    orders: &RGBW_ORDERS,
    modes: &SPI_RGBW_MODES,
};

static MULTI_TYPES: [(u8, &LightType); 4] = [
    (0x81, &PWM_MONO),
    (0x85, &PWM_RGB),
    (0x86, &SPI_RGB),
    (0x88, &SPI_RGBW),
];

static SP631E_TYPES: [(u8, &LightType); 1] = [(0x01, &PWM_MONO)];
static SP633E_TYPES: [(u8, &LightType); 1] = [(0x05, &PWM_RGB)];
static SP638E_TYPES: [(u8, &LightType); 1] = [(0x06, &SPI_RGB)];
static SP639E_TYPES: [(u8, &LightType); 1] = [(0x08, &SPI_RGBW)];

/// Light type reported by the device, kept as the master context.
#[derive(Debug, Clone, Copy)]
pub struct ActiveLightType {
    /// Wire key.
    pub key: u8,
    /// Configuration behind the key.
    pub light_type: &'static LightType,
}

fn keyed_name(table: &[(u8, &'static str)], key: u8) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, name)| *name)
}

fn keyed_code(table: &[(u8, &str)], name: &str) -> Option<u8> {
    table
        .iter()
        .find(|(_, n)| n.eq_ignore_ascii_case(name))
        .map(|(key, _)| *key)
}

fn keyed_names(table: &[(u8, &str)]) -> Vec<String> {
    table.iter().map(|(_, name)| (*name).to_string()).collect()
}

/// Resolves a select value by name or key against a keyed table.
fn expect_keyed(attribute: Attribute, value: &Value, table: &[(u8, &str)]) -> Result<u8> {
    let key = match value {
        Value::Text(name) => keyed_code(table, name),
        other => other
            .as_int()
            .and_then(|v| u8::try_from(v).ok())
            .filter(|v| table.iter().any(|(k, _)| k == v)),
    };
    key.ok_or_else(|| Error::invalid(attribute, format!("unknown option {value}")))
}

fn status_byte(status: &Status, attribute: Attribute) -> Option<u8> {
    status.get_int(attribute).and_then(|v| u8::try_from(v).ok())
}

fn effect_kind(light_type: &LightType, mode: u8, effect: u8) -> EffectKind {
    if is_custom(mode) && light_type.spi && effect == 0x01 {
        EffectKind::Static
    } else if is_static(mode) {
        EffectKind::Static
    } else if is_sound(mode) {
        EffectKind::Sound
    } else {
        EffectKind::Dynamic
    }
}

/// SPTech descriptor.
#[derive(Debug)]
pub struct SpTech {
    name: &'static str,
    code: u8,
    transport: TransportKind,
    light_types: &'static [(u8, &'static LightType)],
    attributes: AttributeMap<Self>,
}

impl SpTech {
    /// Multi light type BLE controller.
    #[must_use]
    pub fn sp630e() -> Self {
        Self::new("SP630E", 0x1F, TransportKind::Ble, &MULTI_TYPES)
    }

    /// Single colour PWM controller.
    #[must_use]
    pub fn sp631e() -> Self {
        Self::new("SP631E", 0x20, TransportKind::Ble, &SP631E_TYPES)
    }

    /// RGB PWM controller.
    #[must_use]
    pub fn sp633e() -> Self {
        Self::new("SP633E", 0x22, TransportKind::Ble, &SP633E_TYPES)
    }

    /// RGB SPI controller.
    #[must_use]
    pub fn sp638e() -> Self {
        Self::new("SP638E", 0x27, TransportKind::Ble, &SP638E_TYPES)
    }

    /// RGBW SPI controller.
    #[must_use]
    pub fn sp639e() -> Self {
        Self::new("SP639E", 0x28, TransportKind::Ble, &SP639E_TYPES)
    }

    /// Multi light type network controller.
    #[must_use]
    pub fn sp530e() -> Self {
        Self::new("SP530E", 0x4E, TransportKind::Net, &MULTI_TYPES)
    }

    fn new(
        name: &'static str,
        code: u8,
        transport: TransportKind,
        light_types: &'static [(u8, &'static LightType)],
    ) -> Self {
        let attributes = AttributeMap::new()
            .with(Attribute::Power, Self::encode_power)
            .with(Attribute::Brightness, Self::encode_brightness)
            .with(Attribute::RgbColor, Self::encode_rgb)
            .with(Attribute::RgbwColor, Self::encode_rgbw)
            .with(Attribute::White, Self::encode_white)
            .with_list(Attribute::LightMode, Self::encode_light_mode, Self::list_light_modes)
            .with_list(Attribute::Effect, Self::encode_effect, Self::list_effects)
            .with(Attribute::EffectSpeed, Self::encode_speed)
            .with(Attribute::EffectLength, Self::encode_length)
            .with(Attribute::EffectDirection, Self::encode_direction)
            .with(Attribute::EffectLoop, Self::encode_loop)
            .with(Attribute::EffectPlay, Self::encode_play)
            .with_list(Attribute::AudioInput, Self::encode_audio_input, Self::list_audio_inputs)
            .with(Attribute::Sensitivity, Self::encode_sensitivity)
            .with_list(Attribute::LightType, Self::encode_light_type, Self::list_light_types)
            .with_list(Attribute::ChipOrder, Self::encode_chip_order, Self::list_chip_orders)
            .with_list(Attribute::OnOffEffect, Self::encode_onoff_effect, Self::list_onoff_effects)
            .with_list(Attribute::OnOffSpeed, Self::encode_onoff_speed, Self::list_onoff_speeds)
            .with(Attribute::OnOffPixels, Self::encode_onoff_pixels)
            .with_list(Attribute::OnPower, Self::encode_on_power, Self::list_on_power);
        Self {
            name,
            code,
            transport,
            light_types,
            attributes,
        }
    }

    const fn header(&self) -> HeaderForm {
        match self.transport {
            TransportKind::Net => NET_HEADER,
            _ => BLE_HEADER,
        }
    }

    const fn header_len(&self) -> usize {
        let header = self.header();
        header.magic.len() + 2 + header.flags.len() + header.length.width()
    }

    fn frame(&self, opcode: u8, payload: &[u8]) -> Result<Command> {
        Ok(Command::write(Envelope::Header(self.header()).encode(opcode, payload)?))
    }

    fn query(&self) -> Result<Command> {
        match self.transport {
            TransportKind::Net => self.frame(OP_QUERY, &[]),
            _ => self.frame(OP_QUERY, &[0x01]),
        }
    }

    /// Light type behind a reported key. An unknown key on a multi type
    /// controller falls back to the first configuration.
    fn light_type(&self, key: u8) -> Option<ActiveLightType> {
        self.light_types
            .iter()
            .find(|(k, _)| *k == key)
            .or_else(|| (self.light_types.len() > 1).then_some(&self.light_types[0]))
            .map(|&(key, light_type)| ActiveLightType { key, light_type })
    }

    fn light_type_by_value(&self, value: &Value) -> Option<ActiveLightType> {
        let found = match value {
            Value::Text(name) => self
                .light_types
                .iter()
                .find(|(_, lt)| lt.name.eq_ignore_ascii_case(name)),
            other => other
                .as_int()
                .and_then(|v| u8::try_from(v).ok())
                .and_then(|v| self.light_types.iter().find(|(k, _)| *k == v)),
        };
        found.map(|&(key, light_type)| ActiveLightType { key, light_type })
    }

    fn active(&self, view: &ChannelView, attribute: Attribute) -> Result<&'static LightType> {
        if let Some(active) = view.context::<ActiveLightType>() {
            return Ok(active.light_type);
        }
        match self.light_types {
            [(_, only)] => Ok(*only),
            _ => Err(Error::invalid(attribute, "light type not reported yet")),
        }
    }

    fn current_mode(view: &ChannelView, attribute: Attribute) -> Result<u8> {
        status_byte(&view.status, Attribute::LightModeNumber)
            .ok_or_else(|| Error::invalid(attribute, "light mode not reported yet"))
    }

    /// Frames switching to a light mode. The effect is kept when the new
    /// mode offers it, otherwise the mode's first effect is used.
    fn light_mode_frames(
        &self,
        light_type: &LightType,
        status: &Status,
        mode: u8,
        effect: Option<u8>,
    ) -> Result<Vec<Command>> {
        let catalog = light_type.effects(mode).ok_or_else(|| {
            Error::invalid(
                Attribute::LightMode,
                format!("mode {mode} is not offered by {}", light_type.name),
            )
        })?;
        let effect = effect
            .or_else(|| status_byte(status, Attribute::EffectNumber))
            .filter(|e| catalog.contains(*e))
            .or_else(|| catalog.first().map(|fx| fx.number))
            .ok_or_else(|| Error::invalid(Attribute::Effect, "mode has no effects"))?;

        let mut frames = vec![self.frame(OP_LIGHT_MODE, &[mode, effect])?];
        if status_byte(status, Attribute::LightModeNumber) != Some(mode) {
            frames.push(self.query()?);
        }
        Ok(frames)
    }

    fn onoff_frame(
        &self,
        status: &Status,
        effect: Option<u8>,
        speed: Option<u8>,
        pixels: Option<u16>,
    ) -> Result<Command> {
        let effect = effect
            .or_else(|| {
                status
                    .get_text(Attribute::OnOffEffect)
                    .and_then(|name| keyed_code(&ONOFF_EFFECTS, name))
            })
            .unwrap_or(0x01);
        let speed = speed
            .or_else(|| {
                status
                    .get_text(Attribute::OnOffSpeed)
                    .and_then(|name| keyed_code(&ONOFF_SPEEDS, name))
            })
            .unwrap_or(0x02);
        let pixels = pixels
            .or_else(|| {
                status
                    .get_int(Attribute::OnOffPixels)
                    .and_then(|v| u16::try_from(v).ok())
            })
            .unwrap_or(MIN_ONOFF_PIXELS as u16);
        let [hi, lo] = pixels.to_be_bytes();
        self.frame(OP_ONOFF, &[0x01, effect, speed, hi, lo])
    }

    fn encode_power(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let on = expect_bool(Attribute::Power, value)?;
        Ok(vec![self.frame(OP_POWER, &[u8::from(on)])?])
    }

    fn encode_brightness(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let level = expect_u8(Attribute::Brightness, value)?;
        let mode = status_byte(&view.status, Attribute::LightModeNumber).unwrap_or(MODE_STATIC_COLOR);
        if is_sound(mode) {
            return Err(Error::invalid(
                Attribute::Brightness,
                "brightness is fixed in sound modes",
            ));
        }
        let which = u8::from(!is_color(mode));
        Ok(vec![self.frame(OP_LEVEL, &[which, level])?])
    }

    fn rgb_frame(&self, view: &ChannelView, [r, g, b]: [u8; 3]) -> Result<Command> {
        let mode = status_byte(&view.status, Attribute::LightModeNumber);
        if mode.is_some_and(is_static) {
            let level = status_byte(&view.status, Attribute::Brightness).unwrap_or(u8::MAX);
            self.frame(OP_STATIC_COLOR, &[r, g, b, level])
        } else {
            self.frame(OP_EFFECT_COLOR, &[r, g, b])
        }
    }

    fn encode_rgb(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let rgb = expect_rgb(Attribute::RgbColor, value)?;
        Ok(vec![self.rgb_frame(view, rgb)?])
    }

    fn encode_rgbw(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let [r, g, b, w] = value
            .as_rgbw()
            .ok_or_else(|| Error::invalid(Attribute::RgbwColor, format!("expected a colour, got {value}")))?;
        Ok(vec![
            self.rgb_frame(view, [r, g, b])?,
            self.frame(OP_LEVEL, &[0x01, w])?,
        ])
    }

    fn encode_white(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let level = expect_u8(Attribute::White, value)?;
        let light_type = self.active(view, Attribute::White)?;
        let mode = Self::current_mode(view, Attribute::White)?;
        if is_white(mode) {
            return Ok(vec![self.frame(OP_LEVEL, &[0x01, level])?]);
        }
        let target = if is_sound(mode) {
            MODE_SOUND_WHITE
        } else if is_dynamic(mode) {
            MODE_DYNAMIC_WHITE
        } else {
            MODE_STATIC_WHITE
        };
        let mut frames = self.light_mode_frames(light_type, &view.status, target, None)?;
        frames.insert(1, self.frame(OP_LEVEL, &[0x01, level])?);
        Ok(frames)
    }

    fn encode_light_mode(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let light_type = self.active(view, Attribute::LightMode)?;
        let mode = light_type.resolve_mode(value)?;
        self.light_mode_frames(light_type, &view.status, mode, None)
    }

    fn list_light_modes(&self, view: &ChannelView) -> Option<Vec<String>> {
        self.active(view, Attribute::LightMode)
            .ok()
            .map(LightType::mode_names)
    }

    fn encode_effect(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let light_type = self.active(view, Attribute::Effect)?;
        let mode = Self::current_mode(view, Attribute::Effect)?;
        let catalog = light_type
            .effects(mode)
            .ok_or_else(|| Error::invalid(Attribute::Effect, format!("unknown light mode {mode}")))?;
        let effect = match value {
            Value::Text(name) => catalog.by_name(name),
            other => other
                .as_int()
                .and_then(|v| u8::try_from(v).ok())
                .and_then(|v| catalog.get(v)),
        }
        .ok_or_else(|| Error::invalid(Attribute::Effect, format!("unknown effect {value}")))?;
        self.light_mode_frames(light_type, &view.status, mode, Some(effect.number))
    }

    fn list_effects(&self, view: &ChannelView) -> Option<Vec<String>> {
        self.effect_catalog(view).map(|catalog| catalog.names())
    }

    fn encode_speed(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let speed = expect_ranged(Attribute::EffectSpeed, value, 1, MAX_SPEED)?;
        Ok(vec![self.frame(OP_SPEED, &[speed as u8])?])
    }

    fn encode_length(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let length = expect_ranged(Attribute::EffectLength, value, 1, MAX_LENGTH)?;
        Ok(vec![self.frame(OP_LENGTH, &[length as u8])?])
    }

    fn encode_direction(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let forward = expect_bool(Attribute::EffectDirection, value)?;
        Ok(vec![self.frame(OP_DIRECTION, &[u8::from(forward)])?])
    }

    fn encode_loop(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let enabled = expect_bool(Attribute::EffectLoop, value)?;
        Ok(vec![self.frame(OP_LOOP, &[u8::from(enabled)])?])
    }

    fn encode_play(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let play = expect_bool(Attribute::EffectPlay, value)?;
        Ok(vec![self.frame(OP_PLAY, &[u8::from(play)])?])
    }

    fn encode_audio_input(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let input = expect_option(Attribute::AudioInput, value, &AUDIO_INPUTS)?;
        Ok(vec![self.frame(OP_AUDIO_INPUT, &[input])?])
    }

    fn list_audio_inputs(&self, _: &ChannelView) -> Option<Vec<String>> {
        Some(chips::names(&AUDIO_INPUTS))
    }

    fn encode_sensitivity(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let gain = expect_ranged(Attribute::Sensitivity, value, 1, MAX_SENSITIVITY)?;
        Ok(vec![self.frame(OP_SENSITIVITY, &[gain as u8])?])
    }

    fn encode_light_type(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let target = self
            .light_type_by_value(value)
            .ok_or_else(|| Error::invalid(Attribute::LightType, format!("unknown light type {value}")))?;
        let light_type = target.light_type;
        let status = &view.status;

        let mut frames = Vec::new();
        if status.get_bool(Attribute::Power) == Some(true) {
            frames.push(self.frame(OP_POWER, &[0x00])?);
        }
        frames.push(self.frame(OP_LIGHT_TYPE, &[0x01, target.key & 0x7F])?);

        let order = status
            .get_text(Attribute::ChipOrder)
            .and_then(|name| light_type.orders.iter().position(|o| *o == name))
            .map_or(0, |index| index as u8);
        frames.push(self.frame(OP_CHIP_ORDER, &[order])?);

        let mode = status_byte(status, Attribute::LightModeNumber)
            .filter(|mode| light_type.has_mode(*mode))
            .or_else(|| light_type.modes.first().map(|(mode, _)| *mode))
            .ok_or_else(|| Error::invalid(Attribute::LightType, "light type has no modes"))?;
        let catalog = light_type
            .effects(mode)
            .ok_or_else(|| Error::invalid(Attribute::LightType, "light type has no modes"))?;
        let effect = status_byte(status, Attribute::EffectNumber)
            .filter(|e| catalog.contains(*e))
            .or_else(|| catalog.first().map(|fx| fx.number))
            .unwrap_or(0x01);
        frames.push(self.frame(OP_LIGHT_MODE, &[mode, effect])?);
        frames.push(self.query()?);
        Ok(frames)
    }

    fn list_light_types(&self, _: &ChannelView) -> Option<Vec<String>> {
        (self.light_types.len() > 1).then(|| {
            self.light_types
                .iter()
                .map(|(_, lt)| lt.name.to_string())
                .collect()
        })
    }

    fn encode_chip_order(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let light_type = self.active(view, Attribute::ChipOrder)?;
        if light_type.orders.is_empty() {
            return Err(Error::Unsupported {
                attribute: Attribute::ChipOrder,
            });
        }
        let order = expect_option(Attribute::ChipOrder, value, light_type.orders)?;
        Ok(vec![self.frame(OP_CHIP_ORDER, &[order])?])
    }

    fn list_chip_orders(&self, view: &ChannelView) -> Option<Vec<String>> {
        let light_type = self.active(view, Attribute::ChipOrder).ok()?;
        (light_type.orders.len() > 1)
            .then(|| chips::names(light_type.orders))
    }

    fn encode_onoff_effect(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let effect = expect_keyed(Attribute::OnOffEffect, value, &ONOFF_EFFECTS)?;
        Ok(vec![self.onoff_frame(&view.status, Some(effect), None, None)?])
    }

    fn list_onoff_effects(&self, _: &ChannelView) -> Option<Vec<String>> {
        Some(keyed_names(&ONOFF_EFFECTS))
    }

    fn encode_onoff_speed(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let speed = expect_keyed(Attribute::OnOffSpeed, value, &ONOFF_SPEEDS)?;
        Ok(vec![self.onoff_frame(&view.status, None, Some(speed), None)?])
    }

    fn list_onoff_speeds(&self, _: &ChannelView) -> Option<Vec<String>> {
        Some(keyed_names(&ONOFF_SPEEDS))
    }

    fn encode_onoff_pixels(&self, view: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let pixels = expect_ranged(Attribute::OnOffPixels, value, MIN_ONOFF_PIXELS, MAX_ONOFF_PIXELS)?;
        Ok(vec![self.onoff_frame(&view.status, None, None, Some(pixels as u16))?])
    }

    fn encode_on_power(&self, _: &ChannelView, value: &Value) -> Result<Vec<Command>> {
        let state = expect_option(Attribute::OnPower, value, &ON_POWER_STATES)?;
        Ok(vec![self.frame(OP_ON_POWER, &[state])?])
    }

    fn list_on_power(&self, _: &ChannelView) -> Option<Vec<String>> {
        Some(chips::names(&ON_POWER_STATES))
    }

    /// Attributes every light type supports.
    fn base_capabilities(&self, light_type: Option<&LightType>) -> BTreeSet<Attribute> {
        let mut capabilities = BTreeSet::from([
            Attribute::Power,
            Attribute::LightMode,
            Attribute::Effect,
            Attribute::OnOffEffect,
            Attribute::OnOffSpeed,
            Attribute::OnOffPixels,
            Attribute::OnPower,
        ]);
        if self.light_types.len() > 1 {
            capabilities.insert(Attribute::LightType);
        }
        if let Some(light_type) = light_type {
            if light_type.orders.len() > 1 {
                capabilities.insert(Attribute::ChipOrder);
            }
            if light_type.hue && light_type.white {
                capabilities.insert(Attribute::White);
            }
        }
        capabilities
    }

    fn decode_info(&self, chunk: &[u8], status: &mut Status) -> Result<ActiveLightType> {
        if chunk.len() < INFO_LEN {
            return Err(Error::decode(format!("info chunk of {} bytes", chunk.len())));
        }
        let firmware = String::from_utf8_lossy(&chunk[2..10])
            .trim_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_string();
        let key = chunk[10];
        let active = self
            .light_type(key)
            .ok_or_else(|| Error::decode(format!("no light type for key {key:#04x}")))?;

        status.set(Attribute::Firmware, Some(Value::from(firmware)));
        if self.light_types.len() > 1 {
            status.set(Attribute::LightType, Some(Value::from(active.light_type.name)));
        }
        status.set(
            Attribute::OnOffEffect,
            keyed_name(&ONOFF_EFFECTS, chunk[11]).map(Value::from),
        );
        status.set(
            Attribute::OnOffSpeed,
            keyed_name(&ONOFF_SPEEDS, chunk[12]).map(Value::from),
        );
        status.set(
            Attribute::OnOffPixels,
            Some(Value::from(u16::from_be_bytes([chunk[13], chunk[14]]))),
        );
        status.set(
            Attribute::OnPower,
            ON_POWER_STATES.get(usize::from(chunk[16])).copied().map(Value::from),
        );
        Ok(active)
    }

    /// Decodes the settings chunk. Returns the capability set, or `None`
    /// while the light type is unknown.
    fn decode_settings(
        &self,
        active: Option<ActiveLightType>,
        data: &[u8],
        status: &mut Status,
    ) -> Result<Option<BTreeSet<Attribute>>> {
        if data.len() < SETTINGS_LEN {
            return Err(Error::decode(format!("settings chunk of {} bytes", data.len())));
        }
        let power = data[1] != 0;
        status.set(Attribute::Power, Some(Value::from(power)));
        let Some(active) = active else {
            tracing::debug!("settings received before the light type");
            return Ok(None);
        };
        let light_type = active.light_type;

        let mode = data[4];
        let effect = data[5];
        let level_color = data[7];
        let level_white = data[8];
        let static_rgb = [data[9], data[10], data[11]];
        let effect_rgb = [data[19], data[20], data[21]];

        if light_type.orders.len() > 1 {
            status.set(
                Attribute::ChipOrder,
                light_type.orders.get(usize::from(data[3])).copied().map(Value::from),
            );
        }
        status.set(Attribute::LightModeNumber, Some(Value::from(mode)));
        status.set(
            Attribute::LightMode,
            Some(Value::from(keyed_name(&MODES, mode).unwrap_or("Unknown"))),
        );
        status.set(Attribute::EffectNumber, Some(Value::from(effect)));

        let mut capabilities = self.base_capabilities(Some(light_type));
        if !is_sound(mode) {
            capabilities.insert(Attribute::Brightness);
        }

        let Some(fx) = light_type.effects(mode).and_then(|catalog| catalog.get(effect)) else {
            tracing::debug!("unknown effect {effect:#04x} in mode {mode:#04x}");
            return Ok(Some(capabilities));
        };
        status.set(Attribute::Effect, Some(Value::from(fx.name.as_ref())));
        status.set(
            Attribute::EffectType,
            Some(Value::from(effect_kind(light_type, mode, effect).as_str())),
        );

        if loops(mode) {
            status.set(Attribute::EffectLoop, Some(Value::from(data[2] != 0)));
            capabilities.insert(Attribute::EffectLoop);
        }
        if fx.pausable {
            status.set(Attribute::EffectPlay, Some(Value::from(data[6] != 0)));
            capabilities.insert(Attribute::EffectPlay);
        }
        if fx.speedable {
            status.set(Attribute::EffectSpeed, Some(Value::from(data[14])));
            capabilities.insert(Attribute::EffectSpeed);
        }
        if fx.sizeable {
            status.set(Attribute::EffectLength, Some(Value::from(data[15])));
            capabilities.insert(Attribute::EffectLength);
        }
        if fx.directional {
            status.set(Attribute::EffectDirection, Some(Value::from(data[16] != 0)));
            capabilities.insert(Attribute::EffectDirection);
        }

        let level = if is_white(mode) { level_white } else { level_color };
        if is_sound(mode) {
            capabilities.insert(Attribute::AudioInput);
            capabilities.insert(Attribute::Sensitivity);
            if power {
                status.set(
                    Attribute::AudioInput,
                    AUDIO_INPUTS.get(usize::from(data[18])).copied().map(Value::from),
                );
                status.set(Attribute::Sensitivity, Some(Value::from(data[17])));
            }
            if is_color(mode) && fx.colorable && light_type.hue {
                status.set(Attribute::Brightness, Some(Value::from(u8::MAX)));
                status.set(Attribute::RgbColor, Some(Value::from(effect_rgb)));
                capabilities.insert(Attribute::RgbColor);
            }
        } else if is_dynamic(mode) {
            if is_color(mode) && fx.colorable && light_type.hue {
                status.set(Attribute::RgbColor, Some(Value::from(effect_rgb)));
                capabilities.insert(Attribute::RgbColor);
            }
            status.set(Attribute::Brightness, Some(Value::from(level)));
        } else if is_static(mode) {
            if light_type.hue {
                status.set(Attribute::RgbColor, Some(Value::from(static_rgb)));
                if is_color(mode) {
                    capabilities.insert(Attribute::RgbColor);
                }
                if light_type.white {
                    status.set(Attribute::White, Some(Value::from(level_white)));
                    if is_color(mode) {
                        capabilities.insert(Attribute::RgbwColor);
                    }
                }
            }
            status.set(Attribute::Brightness, Some(Value::from(level)));
        } else if is_custom(mode) {
            status.set(Attribute::Brightness, Some(Value::from(level_color)));
        }
        Ok(Some(capabilities))
    }
}

impl ModelDescriptor for SpTech {
    fn name(&self) -> &str {
        self.name
    }

    fn code(&self) -> u8 {
        self.code
    }

    fn manufacturer(&self) -> &str {
        "SPLED (SPTech)"
    }

    fn transport(&self) -> TransportKind {
        self.transport
    }

    fn matches(&self, advertisement: &Advertisement) -> bool {
        match advertisement {
            Advertisement::Net(_) => {
                self.transport == TransportKind::Net && advertisement.code() == Some(self.code)
            }
            Advertisement::Ble { .. } => {
                self.transport == TransportKind::Ble
                    && advertisement
                        .manufacturer(MANUFACTURER_ID)
                        .is_some_and(|data| data.first() == Some(&self.code))
            }
        }
    }

    fn endpoints(&self) -> Endpoints {
        match self.transport {
            TransportKind::Net => Endpoints::shared(None, Endpoint::Port(NET_PORT)),
            _ => Endpoints::shared(Some(short_uuid(0xFFE0)), Endpoint::short(0xFFE1)),
        }
    }

    fn framing(&self) -> Framing {
        let header = self.header();
        Framing::Prefixed(PrefixedForm {
            magic: header.magic,
            header_len: self.header_len(),
            length_offset: self.header_len() - header.length.width(),
            length: header.length,
        })
    }

    fn state_query(&self) -> Result<Vec<Command>> {
        Ok(vec![self.query()?])
    }

    fn capabilities(&self, _channel: u8) -> BTreeSet<Attribute> {
        let mut capabilities = self.base_capabilities(match self.light_types {
            [(_, only)] => Some(*only),
            _ => None,
        });
        capabilities.insert(Attribute::Brightness);
        capabilities
    }

    fn encode(&self, view: &ChannelView, attribute: Attribute, value: &Value) -> Result<Vec<Command>> {
        self.attributes.encode(self, view, attribute, value)
    }

    fn options(&self, view: &ChannelView, attribute: Attribute) -> Option<Vec<String>> {
        self.attributes.options(self, view, attribute)
    }

    fn effect_catalog(&self, view: &ChannelView) -> Option<EffectCatalog> {
        let light_type = self.active(view, Attribute::Effect).ok()?;
        let mode = status_byte(&view.status, Attribute::LightModeNumber)?;
        light_type.effects(mode)
    }

    fn decode(&self, payload: &[u8], context: Option<&Context>) -> Result<StatusReport> {
        let header = self.header();
        let header_len = self.header_len();
        if payload.len() < header_len || !payload.starts_with(header.magic) {
            return Err(Error::decode(format!(
                "not an SPTech frame: {}",
                hex::encode(payload)
            )));
        }
        let opcode = payload[header.magic.len()];
        let key = payload[header.magic.len() + 1];
        if opcode != OP_QUERY {
            tracing::trace!("ignoring response to {opcode:#04x}");
            return Ok(StatusReport::default());
        }
        if key != 0 {
            return Err(Error::decode(format!("encoded response with key {key:#04x}")));
        }

        let (&flag, mut data) = payload[header_len..]
            .split_first()
            .ok_or_else(|| Error::decode("empty status payload"))?;
        let width = 1 + usize::from(flag != 0);

        let mut active = context
            .and_then(|c| c.downcast_ref::<ActiveLightType>())
            .copied();
        let mut reported = None;
        let mut capabilities = None;
        let mut status = Status::new();

        while !data.is_empty() {
            if data.len() < 1 + width {
                return Err(Error::decode("truncated chunk header"));
            }
            let kind = data[0];
            let size = match width {
                1 => usize::from(data[1]),
                _ => usize::from(u16::from_be_bytes([data[1], data[2]])),
            };
            data = &data[1 + width..];
            if data.len() < size {
                return Err(Error::decode(format!(
                    "chunk {kind} wants {size} bytes, {} left",
                    data.len()
                )));
            }
            let (chunk, rest) = data.split_at(size);
            data = rest;

            match kind {
                CHUNK_INFO => {
                    let info = self.decode_info(chunk, &mut status)?;
                    active = Some(info);
                    reported = Some(info);
                }
                CHUNK_SETTINGS => {
                    capabilities = self.decode_settings(active, chunk, &mut status)?;
                }
                CHUNK_SETTINGS_EXT => {
                    let settings = chunk
                        .get(2..)
                        .ok_or_else(|| Error::decode("truncated settings chunk"))?;
                    capabilities = self.decode_settings(active, settings, &mut status)?;
                }
                other => tracing::trace!("skipping chunk {other} of {size} bytes"),
            }
        }

        let mut report = if reported.is_some() {
            ChannelReport::replace(0, status)
        } else {
            ChannelReport::update(0, status)
        };
        if let Some(capabilities) = capabilities {
            report = report.with_capabilities(capabilities);
        }
        Ok(StatusReport {
            channels: vec![report],
            context: reported.map(|info| Arc::new(info) as Context),
        })
    }
}
