//! Channel attributes and their values.

use std::fmt;
use std::str::FromStr;

/// A named, controllable or reported property of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Attribute {
    Power,
    Brightness,
    RgbColor,
    RgbwColor,
    White,
    Effect,
    EffectNumber,
    EffectType,
    EffectSpeed,
    EffectLength,
    EffectDirection,
    EffectLoop,
    EffectPlay,
    LightMode,
    LightModeNumber,
    LightType,
    ChipType,
    ChipOrder,
    SegmentPixels,
    AudioInput,
    Sensitivity,
    Scene,
    SceneLoop,
    OnPower,
    OnOffEffect,
    OnOffSpeed,
    OnOffPixels,
    Firmware,
    Channels,
    NodeId,
    Online,
}

impl Attribute {
    /// All attributes, in declaration order.
    pub const ALL: [Self; 31] = [
        Self::Power,
        Self::Brightness,
        Self::RgbColor,
        Self::RgbwColor,
        Self::White,
        Self::Effect,
        Self::EffectNumber,
        Self::EffectType,
        Self::EffectSpeed,
        Self::EffectLength,
        Self::EffectDirection,
        Self::EffectLoop,
        Self::EffectPlay,
        Self::LightMode,
        Self::LightModeNumber,
        Self::LightType,
        Self::ChipType,
        Self::ChipOrder,
        Self::SegmentPixels,
        Self::AudioInput,
        Self::Sensitivity,
        Self::Scene,
        Self::SceneLoop,
        Self::OnPower,
        Self::OnOffEffect,
        Self::OnOffSpeed,
        Self::OnOffPixels,
        Self::Firmware,
        Self::Channels,
        Self::NodeId,
        Self::Online,
    ];

    /// Returns the attribute identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Power => "power",
            Self::Brightness => "brightness",
            Self::RgbColor => "rgb_color",
            Self::RgbwColor => "rgbw_color",
            Self::White => "white",
            Self::Effect => "effect",
            Self::EffectNumber => "effect_number",
            Self::EffectType => "effect_type",
            Self::EffectSpeed => "effect_speed",
            Self::EffectLength => "effect_length",
            Self::EffectDirection => "effect_direction",
            Self::EffectLoop => "effect_loop",
            Self::EffectPlay => "effect_play",
            Self::LightMode => "light_mode",
            Self::LightModeNumber => "light_mode_number",
            Self::LightType => "light_type",
            Self::ChipType => "chip_type",
            Self::ChipOrder => "chip_order",
            Self::SegmentPixels => "segment_pixels",
            Self::AudioInput => "audio_input",
            Self::Sensitivity => "sensitivity",
            Self::Scene => "scene",
            Self::SceneLoop => "scene_loop",
            Self::OnPower => "on_power",
            Self::OnOffEffect => "onoff_effect",
            Self::OnOffSpeed => "onoff_speed",
            Self::OnOffPixels => "onoff_pixels",
            Self::Firmware => "firmware",
            Self::Channels => "channels",
            Self::NodeId => "node_id",
            Self::Online => "online",
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Attribute {
    type Err = UnknownAttribute;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|attribute| attribute.as_str() == s)
            .ok_or_else(|| UnknownAttribute(s.to_string()))
    }
}

/// Returned when parsing an attribute identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAttribute(pub String);

impl fmt::Display for UnknownAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown attribute '{}'", self.0)
    }
}

impl std::error::Error for UnknownAttribute {}

/// The value held by an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
    Rgb([u8; 3]),
    Rgbw([u8; 4]),
}

impl Value {
    /// Returns the value as a boolean; integers are true when non-zero.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Returns the value as an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Returns the value as text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as an RGB triple.
    #[must_use]
    pub const fn as_rgb(&self) -> Option<[u8; 3]> {
        match self {
            Self::Rgb(rgb) => Some(*rgb),
            Self::Rgbw([r, g, b, _]) => Some([*r, *g, *b]),
            _ => None,
        }
    }

    /// Returns the value as an RGBW quadruple.
    #[must_use]
    pub const fn as_rgbw(&self) -> Option<[u8; 4]> {
        match self {
            Self::Rgbw(rgbw) => Some(*rgbw),
            _ => None,
        }
    }

    /// Returns the integer value if it lies within `min..=max`.
    #[must_use]
    pub fn as_ranged(&self, min: i64, max: i64) -> Option<i64> {
        self.as_int().filter(|v| (min..=max).contains(v))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
            Self::Rgb([r, g, b]) => write!(f, "({r}, {g}, {b})"),
            Self::Rgbw([r, g, b, w]) => write!(f, "({r}, {g}, {b}, {w})"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<[u8; 3]> for Value {
    fn from(value: [u8; 3]) -> Self {
        Self::Rgb(value)
    }
}

impl From<[u8; 4]> for Value {
    fn from(value: [u8; 4]) -> Self {
        Self::Rgbw(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_names() {
        for attribute in Attribute::ALL {
            assert_eq!(attribute.as_str().parse::<Attribute>(), Ok(attribute));
        }
        assert!("build_onoff".parse::<Attribute>().is_err());
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(true).as_int(), Some(1));
        assert_eq!(Value::from(0u8).as_bool(), Some(false));
        assert_eq!(Value::from([1, 2, 3, 4]).as_rgb(), Some([1, 2, 3]));
        assert_eq!(Value::from([1, 2, 3]).as_rgbw(), None);
        assert_eq!(Value::from(11u8).as_ranged(1, 10), None);
        assert_eq!(Value::from(10u8).as_ranged(1, 10), Some(10));
        assert_eq!(Value::from("Solid").as_text(), Some("Solid"));
    }
}
