//! Channels and their cached status.
//!
//! A device has one or more channels. Channel 0 is the master; segment
//! channels are numbered from 1. Each channel caches a [`Status`] map and a
//! set of supported attributes, and fans changes out to registered
//! callbacks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};
use std::sync::Arc;

use crate::model::Context;
use crate::types::{Attribute, Value};

/// Attribute map of one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status(BTreeMap<Attribute, Value>);

impl Status {
    /// Creates an empty status.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of an attribute.
    #[must_use]
    pub fn get(&self, attribute: Attribute) -> Option<&Value> {
        self.0.get(&attribute)
    }

    /// Sets an attribute; `None` removes it.
    pub fn set(&mut self, attribute: Attribute, value: Option<Value>) {
        match value {
            Some(value) => {
                self.0.insert(attribute, value);
            }
            None => {
                self.0.remove(&attribute);
            }
        }
    }

    /// Inserts a value, builder style.
    #[must_use]
    pub fn with(mut self, attribute: Attribute, value: impl Into<Value>) -> Self {
        self.0.insert(attribute, value.into());
        self
    }

    /// Returns true if the attribute has a value.
    #[must_use]
    pub fn has(&self, attribute: Attribute) -> bool {
        self.0.contains_key(&attribute)
    }

    /// Boolean value of an attribute.
    #[must_use]
    pub fn get_bool(&self, attribute: Attribute) -> Option<bool> {
        self.get(attribute).and_then(Value::as_bool)
    }

    /// Integer value of an attribute.
    #[must_use]
    pub fn get_int(&self, attribute: Attribute) -> Option<i64> {
        self.get(attribute).and_then(Value::as_int)
    }

    /// Text value of an attribute.
    #[must_use]
    pub fn get_text(&self, attribute: Attribute) -> Option<&str> {
        self.get(attribute).and_then(Value::as_text)
    }

    /// Merges `other` into this status. Returns true if anything changed.
    pub fn merge(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (attribute, value) in &other.0 {
            if self.0.get(attribute) != Some(value) {
                self.0.insert(*attribute, value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Iterates over attribute values in attribute order.
    pub fn iter(&self) -> impl Iterator<Item = (Attribute, &Value)> {
        self.0.iter().map(|(attribute, value)| (*attribute, value))
    }

    /// Number of attributes held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no attribute is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// One line per attribute, for diagnostics.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (attribute, value) in &self.0 {
            let _ = writeln!(out, "{attribute}: {value}");
        }
        out
    }
}

impl FromIterator<(Attribute, Value)> for Status {
    fn from_iter<I: IntoIterator<Item = (Attribute, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Identifies a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub(crate) u64);

/// Snapshot handed to callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelState {
    /// Channel number.
    pub number: u8,
    /// Status at the time of the change.
    pub status: Status,
}

/// Change callback.
pub type Callback = Arc<dyn Fn(&ChannelState) + Send + Sync>;

/// Callbacks and the state they should see, fired once locks are released.
#[must_use = "pending notifications do nothing until fired"]
pub struct Pending {
    state: ChannelState,
    callbacks: Vec<Callback>,
}

impl Pending {
    /// Invokes every callback with the snapshot.
    pub fn fire(self) {
        for callback in &self.callbacks {
            callback(&self.state);
        }
    }
}

/// Read-only view of a channel handed to model descriptors.
#[derive(Debug, Clone)]
pub struct ChannelView {
    /// Channel number, 0 for the master.
    pub number: u8,
    /// Cached status.
    pub status: Status,
    /// Descriptor-private context of the device.
    pub context: Option<Context>,
}

impl ChannelView {
    /// Creates a view with no context.
    #[must_use]
    pub fn new(number: u8, status: Status) -> Self {
        Self {
            number,
            status,
            context: None,
        }
    }

    /// Downcasts the context to a descriptor type.
    #[must_use]
    pub fn context<T: 'static>(&self) -> Option<&T> {
        self.context.as_ref().and_then(|c| c.downcast_ref::<T>())
    }
}

/// One addressable output of a device.
pub struct Channel {
    number: u8,
    status: Status,
    capabilities: BTreeSet<Attribute>,
    context: Option<Context>,
    callbacks: Vec<(CallbackId, Callback)>,
}

impl Channel {
    /// Creates a channel with the given capabilities.
    #[must_use]
    pub fn new(number: u8, capabilities: BTreeSet<Attribute>) -> Self {
        Self {
            number,
            status: Status::new(),
            capabilities,
            context: None,
            callbacks: Vec::new(),
        }
    }

    /// Channel number.
    #[must_use]
    pub const fn number(&self) -> u8 {
        self.number
    }

    /// Identifier, `channel_{n}`.
    #[must_use]
    pub fn identity(&self) -> String {
        format!("channel_{}", self.number)
    }

    /// Human readable title.
    #[must_use]
    pub fn title(&self) -> String {
        if self.is_master() {
            "Master".to_string()
        } else {
            format!("Channel {}", self.number)
        }
    }

    /// Returns true for channel 0.
    #[must_use]
    pub const fn is_master(&self) -> bool {
        self.number == 0
    }

    /// Cached status.
    #[must_use]
    pub const fn status(&self) -> &Status {
        &self.status
    }

    /// Supported attributes.
    #[must_use]
    pub const fn capabilities(&self) -> &BTreeSet<Attribute> {
        &self.capabilities
    }

    /// Returns true if the attribute may be set on this channel.
    #[must_use]
    pub fn supports(&self, attribute: Attribute) -> bool {
        self.capabilities.contains(&attribute)
    }

    /// Replaces the supported attributes.
    pub fn set_capabilities(&mut self, capabilities: BTreeSet<Attribute>) {
        self.capabilities = capabilities;
    }

    /// Descriptor-private context.
    #[must_use]
    pub const fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    /// Sets the descriptor-private context.
    pub fn set_context(&mut self, context: Option<Context>) {
        self.context = context;
    }

    /// Swaps in a complete status.
    pub fn replace(&mut self, status: Status) -> Pending {
        self.status = status;
        self.pending()
    }

    /// Merges a partial status. Notifies only if something changed and
    /// `notify` is set.
    pub fn update(&mut self, status: &Status, notify: bool) -> Option<Pending> {
        let changed = self.status.merge(status);
        (changed && notify).then(|| self.pending())
    }

    /// Sets one attribute without notifying.
    pub fn set(&mut self, attribute: Attribute, value: Option<Value>) {
        self.status.set(attribute, value);
    }

    /// Re-notifies the current state.
    pub fn refresh(&self) -> Pending {
        self.pending()
    }

    /// Registers a change callback.
    pub fn register(&mut self, id: CallbackId, callback: Callback) {
        self.callbacks.push((id, callback));
    }

    /// Removes a callback. Returns false if it was not registered.
    pub fn unregister(&mut self, id: CallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(registered, _)| *registered != id);
        self.callbacks.len() != before
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        ChannelState {
            number: self.number,
            status: self.status.clone(),
        }
    }

    /// View for encode and option queries.
    #[must_use]
    pub fn view(&self, context: Option<Context>) -> ChannelView {
        ChannelView {
            number: self.number,
            status: self.status.clone(),
            context,
        }
    }

    fn pending(&self) -> Pending {
        Pending {
            state: self.state(),
            callbacks: self.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.number)
            .field("status", &self.status)
            .field("capabilities", &self.capabilities)
            .field("callbacks", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_status_set_and_remove() {
        let mut status = Status::new().with(Attribute::Power, true);
        assert!(status.has(Attribute::Power));
        assert_eq!(status.get_bool(Attribute::Power), Some(true));

        status.set(Attribute::Power, None);
        assert!(!status.has(Attribute::Power));
        assert!(status.is_empty());
    }

    #[test]
    fn test_status_merge_reports_change() {
        let mut status = Status::new().with(Attribute::Brightness, 10u8);
        let same = Status::new().with(Attribute::Brightness, 10u8);
        assert!(!status.merge(&same));

        let other = Status::new()
            .with(Attribute::Brightness, 20u8)
            .with(Attribute::Effect, "Solid");
        assert!(status.merge(&other));
        assert_eq!(status.get_int(Attribute::Brightness), Some(20));
        assert_eq!(status.get_text(Attribute::Effect), Some("Solid"));
    }

    #[test]
    fn test_status_dump() {
        let status = Status::new()
            .with(Attribute::Power, false)
            .with(Attribute::RgbColor, [1, 2, 3]);
        assert_eq!(status.dump(), "power: false\nrgb_color: (1, 2, 3)\n");
    }

    #[test]
    fn test_channel_identity() {
        let master = Channel::new(0, BTreeSet::new());
        let segment = Channel::new(3, BTreeSet::new());
        assert_eq!(master.identity(), "channel_0");
        assert_eq!(master.title(), "Master");
        assert_eq!(segment.title(), "Channel 3");
        assert!(!segment.is_master());
    }

    #[test]
    fn test_callbacks_fire_and_unregister() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let mut channel = Channel::new(1, BTreeSet::new());
        channel.register(
            CallbackId(1),
            Arc::new(move |state: &ChannelState| {
                assert_eq!(state.number, 1);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        channel.replace(Status::new().with(Attribute::Power, true)).fire();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Unchanged update does not notify
        let unchanged = Status::new().with(Attribute::Power, true);
        assert!(channel.update(&unchanged, true).is_none());

        channel.refresh().fire();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(channel.unregister(CallbackId(1)));
        assert!(!channel.unregister(CallbackId(1)));
        channel.refresh().fire();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_view_context_downcast() {
        let channel = Channel::new(0, BTreeSet::new());
        let view = channel.view(Some(Arc::new(7u8)));
        assert_eq!(view.context::<u8>(), Some(&7));
        assert_eq!(view.context::<u16>(), None);
    }
}
