//! Effect descriptors and catalogs.

use std::borrow::Cow;
use std::fmt;

/// Broad class of an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    /// A fixed colour or level.
    Static,
    /// An animated pattern.
    Dynamic,
    /// Driven by an audio input.
    Sound,
}

impl EffectKind {
    /// Display name, as reported in the `effect_type` attribute.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Static => "Static",
            Self::Dynamic => "Pattern",
            Self::Sound => "Sound",
        }
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of an effect catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Effect {
    /// Wire code.
    pub number: u8,
    /// Display name.
    pub name: Cow<'static, str>,
    /// Class of the effect.
    pub kind: EffectKind,
    /// Takes a colour.
    pub colorable: bool,
    /// Takes a length.
    pub sizeable: bool,
    /// Takes a direction.
    pub directional: bool,
    /// Takes a speed.
    pub speedable: bool,
    /// Can be paused.
    pub pausable: bool,
}

impl Effect {
    /// A static effect, colourable by default.
    #[must_use]
    pub const fn solid(number: u8, name: &'static str) -> Self {
        Self::new(number, name, EffectKind::Static, true, false)
    }

    /// An animated effect, speedable by default.
    #[must_use]
    pub const fn dynamic(number: u8, name: &'static str) -> Self {
        Self::new(number, name, EffectKind::Dynamic, false, true)
    }

    /// A sound driven effect.
    #[must_use]
    pub const fn sound(number: u8, name: &'static str) -> Self {
        Self::new(number, name, EffectKind::Sound, false, false)
    }

    const fn new(
        number: u8,
        name: &'static str,
        kind: EffectKind,
        colorable: bool,
        speedable: bool,
    ) -> Self {
        Self {
            number,
            name: Cow::Borrowed(name),
            kind,
            colorable,
            sizeable: false,
            directional: false,
            speedable,
            pausable: false,
        }
    }

    /// Replaces the display name with a generated one.
    #[must_use]
    pub fn renamed(mut self, name: String) -> Self {
        self.name = Cow::Owned(name);
        self
    }

    #[must_use]
    pub const fn colorable(mut self) -> Self {
        self.colorable = true;
        self
    }

    #[must_use]
    pub const fn uncolored(mut self) -> Self {
        self.colorable = false;
        self
    }

    #[must_use]
    pub const fn sizeable(mut self) -> Self {
        self.sizeable = true;
        self
    }

    #[must_use]
    pub const fn directional(mut self) -> Self {
        self.directional = true;
        self
    }

    #[must_use]
    pub const fn pausable(mut self) -> Self {
        self.pausable = true;
        self
    }

    #[must_use]
    pub const fn fixed_speed(mut self) -> Self {
        self.speedable = false;
        self
    }
}

/// Lookup table of effects keyed by wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectCatalog {
    effects: &'static [Effect],
}

impl EffectCatalog {
    /// Wraps a table that lives for the whole program.
    #[must_use]
    pub const fn new(effects: &'static [Effect]) -> Self {
        Self { effects }
    }

    /// Looks an effect up by code.
    #[must_use]
    pub fn get(&self, number: u8) -> Option<&'static Effect> {
        self.effects.iter().find(|e| e.number == number)
    }

    /// Looks an effect up by display name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&'static Effect> {
        self.effects.iter().find(|e| e.name == name)
    }

    /// Returns true if the catalog holds `number`.
    #[must_use]
    pub fn contains(&self, number: u8) -> bool {
        self.get(number).is_some()
    }

    /// First entry, used when a mode change needs a default effect.
    #[must_use]
    pub fn first(&self) -> Option<&'static Effect> {
        self.effects.first()
    }

    /// Display names in table order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.effects.iter().map(|e| e.name.to_string()).collect()
    }

    /// Iterates over the entries.
    pub fn iter(&self) -> impl Iterator<Item = &'static Effect> {
        self.effects.iter()
    }

    /// Number of entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.effects.len()
    }

    /// Returns true for an empty catalog.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}
