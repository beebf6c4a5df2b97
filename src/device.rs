//! Device facade.
//!
//! [`Device`] is the public request surface. It owns the channels of one
//! controller and the [`SessionManager`] that reaches it, validates
//! requests against channel capabilities before anything goes on the wire,
//! and applies decoded status to its channels.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::channel::{CallbackId, Channel, ChannelState, ChannelView, Pending, Status};
use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher, EventFilter, Subscription};
use crate::model::{ChannelReport, Command, Context, ModelDescriptor, ReportMode, StatusReport};
use crate::retry::Classification;
use crate::session::{SessionManager, SessionState, StatusSink};
use crate::transport::Transport;
use crate::types::{Attribute, DeviceIdentity, Value};

/// Channels of a device and the descriptor that shaped them.
struct DeviceState {
    name: String,
    model: Mutex<Arc<dyn ModelDescriptor>>,
    channels: Mutex<BTreeMap<u8, Channel>>,
    dispatcher: EventDispatcher,
}

impl DeviceState {
    fn channels(&self) -> MutexGuard<'_, BTreeMap<u8, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn model(&self) -> Arc<dyn ModelDescriptor> {
        Arc::clone(&self.model.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Installs a descriptor and rebuilds the channels it describes.
    fn install(&self, model: Arc<dyn ModelDescriptor>) {
        let channels = build_channels(model.as_ref());
        *self.model.lock().unwrap_or_else(PoisonError::into_inner) = model;
        *self.channels() = channels;
    }

    fn view(&self, number: u8) -> Option<(ChannelView, BTreeSet<Attribute>)> {
        let channels = self.channels();
        let context = channels.get(&0).and_then(|master| master.context().cloned());
        let channel = channels.get(&number)?;
        Some((channel.view(context), channel.capabilities().clone()))
    }

    fn refresh(&self, number: u8) {
        let pending = self.channels().get(&number).map(Channel::refresh);
        if let Some(pending) = pending {
            pending.fire();
        }
    }

    fn merge(&self, number: u8, status: &Status) {
        let pending = self
            .channels()
            .get_mut(&number)
            .and_then(|channel| channel.update(status, true));
        if let Some(pending) = pending {
            pending.fire();
        }
    }
}

impl StatusSink for DeviceState {
    fn context(&self) -> Option<Context> {
        self.channels()
            .get(&0)
            .and_then(|master| master.context().cloned())
    }

    fn apply(&self, report: StatusReport) {
        let model = self.model();
        let mut pending: Vec<Pending> = Vec::new();
        let mut touched = Vec::with_capacity(report.channels.len());
        {
            let mut channels = self.channels();
            if let Some(context) = report.context {
                if let Some(master) = channels.get_mut(&0) {
                    master.set_context(Some(context));
                }
            }
            for ChannelReport {
                number,
                status,
                mode,
                capabilities,
            } in report.channels
            {
                let channel = channels.entry(number).or_insert_with(|| {
                    tracing::debug!("{}: Adding channel {}", self.name, number);
                    Channel::new(number, model.capabilities(number))
                });
                if let Some(capabilities) = capabilities {
                    channel.set_capabilities(capabilities);
                }
                match mode {
                    ReportMode::Replace => pending.push(channel.replace(status)),
                    ReportMode::Update => pending.extend(channel.update(&status, true)),
                }
                touched.push(number);
            }
        }

        // Callbacks run with no lock held
        for notification in pending {
            notification.fire();
        }
        if !touched.is_empty() {
            self.dispatcher
                .dispatch(Event::StatusUpdated { channels: touched });
        }
    }
}

fn build_channels(model: &dyn ModelDescriptor) -> BTreeMap<u8, Channel> {
    let mut channels = BTreeMap::new();
    channels.insert(0, Channel::new(0, model.capabilities(0)));
    if model.master_channel() && model.channels() > 1 {
        for number in 1..=model.channels() {
            channels.insert(number, Channel::new(number, model.capabilities(number)));
        }
    }
    channels
}

/// One controller.
pub struct Device<T> {
    identity: DeviceIdentity,
    config: DeviceConfig,
    state: Arc<DeviceState>,
    session: SessionManager<T>,
    dispatcher: EventDispatcher,
    next_callback: AtomicU64,
}

impl<T: Transport + 'static> Device<T> {
    /// Creates a device for an identified model. Nothing connects until
    /// the first request.
    #[must_use]
    pub fn new(
        identity: DeviceIdentity,
        model: Arc<dyn ModelDescriptor>,
        transport: T,
        config: DeviceConfig,
    ) -> Self {
        let dispatcher = EventDispatcher::default();
        let state = Arc::new(DeviceState {
            name: identity.display_name().to_string(),
            channels: Mutex::new(build_channels(model.as_ref())),
            model: Mutex::new(Arc::clone(&model)),
            dispatcher: dispatcher.clone(),
        });
        let session = SessionManager::new(
            &identity,
            model,
            transport,
            config.clone(),
            dispatcher.clone(),
            Arc::clone(&state) as Arc<dyn StatusSink>,
        );
        Self {
            identity,
            config,
            state,
            session,
            dispatcher,
            next_callback: AtomicU64::new(1),
        }
    }

    /// Device identity.
    #[must_use]
    pub const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Active model descriptor.
    #[must_use]
    pub fn model(&self) -> Arc<dyn ModelDescriptor> {
        self.state.model()
    }

    /// The underlying session.
    #[must_use]
    pub const fn session(&self) -> &SessionManager<T> {
        &self.session
    }

    /// Session state.
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Returns true while a session is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Decode faults since creation.
    #[must_use]
    pub fn protocol_faults(&self) -> u64 {
        self.session.protocol_faults()
    }

    /// Subscribes to device events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.dispatcher.subscribe()
    }

    /// Channel numbers, master first.
    #[must_use]
    pub fn channels(&self) -> Vec<u8> {
        self.state.channels().keys().copied().collect()
    }

    /// Snapshot of a channel.
    #[must_use]
    pub fn channel_state(&self, channel: u8) -> Option<ChannelState> {
        self.state.channels().get(&channel).map(Channel::state)
    }

    /// Capabilities of a channel.
    #[must_use]
    pub fn capabilities(&self, channel: u8) -> Option<BTreeSet<Attribute>> {
        self.state
            .channels()
            .get(&channel)
            .map(|c| c.capabilities().clone())
    }

    /// Sends raw frames.
    pub async fn send(&self, commands: &[Command], retry: Option<u8>) -> Result<()> {
        self.session.send(commands, retry).await
    }

    /// Queries the device and waits for a decoded status.
    ///
    /// Returns false, without an error, when nothing arrives within the
    /// notification timeout.
    pub async fn update(&self, retry: Option<u8>) -> Result<bool> {
        let query = self.model().state_query()?;
        // Subscribe first so a fast reply is not missed
        let mut events = self.dispatcher.subscribe();
        self.session.send(&query, retry).await?;

        let timeout = self.config.notification_timeout();
        if events.wait_for(&EventFilter::status(), timeout).await.is_some() {
            return Ok(true);
        }
        tracing::warn!(
            "{}: No status received within {:?}",
            self.identity.display_name(),
            timeout
        );
        Ok(false)
    }

    /// Sets one attribute of a channel.
    ///
    /// The cached status is updated once the frames are sent. If encoding
    /// or sending fails the channel re-notifies its current state.
    pub async fn set_state(&self, channel: u8, attribute: Attribute, value: impl Into<Value>) -> Result<()> {
        self.apply_changes(channel, vec![(attribute, value.into())], false)
            .await
    }

    /// Sets several attributes in one multi-frame send. Values equal to the
    /// cached ones are skipped.
    pub async fn set_states(&self, channel: u8, changes: Vec<(Attribute, Value)>) -> Result<()> {
        self.apply_changes(channel, changes, true).await
    }

    async fn apply_changes(
        &self,
        channel: u8,
        changes: Vec<(Attribute, Value)>,
        skip_unchanged: bool,
    ) -> Result<()> {
        let model = self.model();
        let Some((mut view, capabilities)) = self.state.view(channel) else {
            let attribute = changes.first().map_or(Attribute::Power, |(a, _)| *a);
            return Err(Error::Unsupported { attribute });
        };
        if let Some((attribute, _)) = changes.iter().find(|(a, _)| !capabilities.contains(a)) {
            tracing::warn!(
                "{}: Channel {} does not support '{}'",
                self.identity.display_name(),
                channel,
                attribute
            );
            return Err(Error::Unsupported {
                attribute: *attribute,
            });
        }

        let mut frames = Vec::new();
        let mut applied = Status::new();
        for (attribute, value) in changes {
            if skip_unchanged && view.status.get(attribute) == Some(&value) {
                tracing::trace!("{}: '{}' unchanged", self.identity.display_name(), attribute);
                continue;
            }
            let encoded = validate(model.as_ref(), &view, attribute, &value)
                .and_then(|()| model.encode(&view, attribute, &value));
            match encoded {
                Ok(encoded) => frames.extend(encoded),
                Err(error) => {
                    self.state.refresh(channel);
                    return Err(error);
                }
            }
            view.status.set(attribute, Some(value.clone()));
            applied.set(attribute, Some(value));
        }

        if frames.is_empty() {
            return Ok(());
        }
        if let Err(error) = self.session.send(&frames, None).await {
            self.state.refresh(channel);
            return Err(error);
        }
        self.state.merge(channel, &applied);
        Ok(())
    }

    /// Option list of a select-like attribute.
    #[must_use]
    pub fn options(&self, channel: u8, attribute: Attribute) -> Option<Vec<String>> {
        let (view, capabilities) = self.state.view(channel)?;
        if !capabilities.contains(&attribute) {
            return None;
        }
        self.model().options(&view, attribute)
    }

    /// Returns true if the channel can run the named effect now.
    #[must_use]
    pub fn supports_effect(&self, channel: u8, effect: &str) -> bool {
        self.state
            .view(channel)
            .is_some_and(|(view, _)| self.model().supports_effect(&view, effect))
    }

    /// Registers a change callback. Returns `None` for an unknown channel.
    ///
    /// Callbacks stay registered until [`Device::unregister_callback`].
    pub fn register_callback(
        &self,
        channel: u8,
        callback: impl Fn(&ChannelState) + Send + Sync + 'static,
    ) -> Option<CallbackId> {
        let mut channels = self.state.channels();
        let target = channels.get_mut(&channel)?;
        let id = CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed));
        target.register(id, Arc::new(callback));
        Some(id)
    }

    /// Removes a change callback. Returns false if it was not registered.
    pub fn unregister_callback(&self, channel: u8, id: CallbackId) -> bool {
        self.state
            .channels()
            .get_mut(&channel)
            .is_some_and(|c| c.unregister(id))
    }

    /// Tries candidate descriptors over a live connection.
    ///
    /// Each candidate gets one status query without retries; the first one
    /// whose reply decodes wins and stays installed. If none answers the
    /// original descriptor is restored. An unreachable device ends the
    /// search with an error.
    pub async fn resolve(
        &self,
        candidates: Vec<Arc<dyn ModelDescriptor>>,
    ) -> Result<Option<Arc<dyn ModelDescriptor>>> {
        let original = self.model();
        let name = self.identity.display_name();
        for model in candidates {
            tracing::info!("{}: Trying {}", name, model.name());
            self.switch_model(Arc::clone(&model)).await;
            match self.update(Some(0)).await {
                Ok(true) => {
                    tracing::info!("{}: Resolved as {}", name, model.name());
                    return Ok(Some(model));
                }
                Ok(false) => tracing::debug!("{}: No answer as {}", name, model.name()),
                Err(error) if error.classify() == Classification::NotFound => {
                    self.switch_model(Arc::clone(&original)).await;
                    return Err(error);
                }
                Err(error) => tracing::debug!("{}: Attempt as {} failed: {}", name, model.name(), error),
            }
        }
        tracing::warn!("{}: No candidate model answered", name);
        self.switch_model(original).await;
        Ok(None)
    }

    async fn switch_model(&self, model: Arc<dyn ModelDescriptor>) {
        if let Err(error) = self.session.stop().await {
            tracing::debug!("{}: Stop before model switch: {}", self.identity.display_name(), error);
        }
        self.session.set_model(Arc::clone(&model));
        self.state.install(model);
    }

    /// Graceful teardown; idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.session.stop().await
    }
}

/// Rejects effects the channel cannot run before anything is encoded.
fn validate(model: &dyn ModelDescriptor, view: &ChannelView, attribute: Attribute, value: &Value) -> Result<()> {
    let (Attribute::Effect, Value::Text(name)) = (attribute, value) else {
        return Ok(());
    };
    let listed = model.options(view, Attribute::Effect);
    let known = model.effect_catalog(view).is_some() || listed.is_some();
    if !known
        || model.supports_effect(view, name)
        || listed.is_some_and(|names| names.iter().any(|n| n == name))
    {
        return Ok(());
    }
    Err(Error::invalid(
        Attribute::Effect,
        format!("effect '{name}' is not available"),
    ))
}

impl<T> std::fmt::Debug for Device<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("identity", &self.identity)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;

    use super::*;
    use crate::model::{BanlanX, LedHue, Zengge};
    use crate::transport::{Endpoint, MemoryHandle, MemoryTransport, Reply};

    const FFE1: Endpoint = Endpoint::short(0xFFE1);
    const STATUS: [u8; 12] = [0x01, 0x79, 0x10, 0x80, 0x03, 0x03, 0x00, 0x3C, 0x10, 0x20, 0x30, 0x00];

    fn device(model: Arc<dyn ModelDescriptor>) -> (Device<MemoryTransport>, MemoryHandle) {
        let (transport, handle) = MemoryTransport::new([FFE1]);
        let device = Device::new(
            DeviceIdentity::ble("AA:BB:CC:DD:EE:FF").with_name("Desk"),
            model,
            transport,
            DeviceConfig::new(),
        );
        (device, handle)
    }

    /// An SP110E that answers its status query.
    fn answering_sp110e() -> (Device<MemoryTransport>, MemoryHandle) {
        let (device, handle) = device(Arc::new(LedHue::sp110e()));
        let query = LedHue::sp110e().state_query().unwrap()[0].data.clone();
        handle.respond(move |_, data| {
            if data == &query[..] {
                vec![Reply::Notify(Bytes::from_static(&STATUS))]
            } else {
                Vec::new()
            }
        });
        (device, handle)
    }

    fn counter(device: &Device<MemoryTransport>, channel: u8) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        device
            .register_callback(channel, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        hits
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_applies_status() {
        let (device, _handle) = answering_sp110e();
        let hits = counter(&device, 0);

        assert!(device.update(None).await.unwrap());
        let state = device.channel_state(0).unwrap();
        assert_eq!(state.status.get_bool(Attribute::Power), Some(true));
        assert_eq!(state.status.get_int(Attribute::Brightness), Some(0x80));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(device.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_times_out() {
        let (device, handle) = device(Arc::new(LedHue::sp110e()));
        let started = tokio::time::Instant::now();

        assert!(!device.update(None).await.unwrap());
        assert!(started.elapsed() >= DeviceConfig::new().notification_timeout());
        assert_eq!(handle.writes_to(FFE1).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_attribute_sends_nothing() {
        let (device, handle) = device(Arc::new(LedHue::sp110e()));

        let result = device.set_state(0, Attribute::Scene, 1u8).await;
        assert!(matches!(
            result,
            Err(Error::Unsupported {
                attribute: Attribute::Scene
            })
        ));
        assert!(handle.writes().is_empty());
        assert_eq!(handle.connects(), 0);

        assert!(device.set_state(7, Attribute::Power, true).await.is_err());
        assert!(handle.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_state_updates_optimistically() {
        let (device, handle) = device(Arc::new(LedHue::sp110e()));
        let hits = counter(&device, 0);

        device.set_state(0, Attribute::Power, true).await.unwrap();
        assert_eq!(handle.writes_to(FFE1), vec![Bytes::from_static(&[0, 0, 0, 0xAA])]);
        let state = device.channel_state(0).unwrap();
        assert_eq!(state.status.get_bool(Attribute::Power), Some(true));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_refreshes_channel() {
        let (device, handle) = device(Arc::new(LedHue::sp110e()));
        let hits = counter(&device, 0);
        handle.fail_writes(100);

        assert!(device.set_state(0, Attribute::Power, true).await.is_err());
        let state = device.channel_state(0).unwrap();
        assert!(!state.status.has(Attribute::Power));
        // Re-notified with the unchanged state
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_effect_rejected_before_dispatch() {
        let (device, handle) = device(Arc::new(LedHue::sp110e()));

        let result = device.set_state(0, Attribute::Effect, "Not An Effect").await;
        assert!(matches!(result, Err(Error::InvalidValue { .. })));
        assert!(handle.writes().is_empty());

        assert!(device.supports_effect(0, "Pattern 4"));
        device.set_state(0, Attribute::Effect, "Pattern 4").await.unwrap();
        assert_eq!(handle.writes_to(FFE1), vec![Bytes::from_static(&[4, 0, 0, 0x2C])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_states_skips_unchanged() {
        let (device, handle) = answering_sp110e();
        assert!(device.update(None).await.unwrap());
        handle.clear_writes();

        device
            .set_states(
                0,
                vec![
                    (Attribute::Power, Value::from(true)),
                    (Attribute::Brightness, Value::from(0x40u8)),
                    (Attribute::RgbColor, Value::from([1u8, 2, 3])),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            handle.writes_to(FFE1),
            vec![
                Bytes::from_static(&[0x40, 0, 0, 0x2A]),
                Bytes::from_static(&[1, 2, 3, 0x1E]),
            ]
        );
        let state = device.channel_state(0).unwrap();
        assert_eq!(state.status.get_int(Attribute::Brightness), Some(0x40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_options_and_callbacks() {
        let (device, _handle) = device(Arc::new(LedHue::sp110e()));
        let chips = device.options(0, Attribute::ChipType).unwrap();
        assert!(!chips.is_empty());
        assert!(device.options(0, Attribute::Power).is_none());

        let id = device.register_callback(0, |_| {}).unwrap();
        assert!(device.unregister_callback(0, id));
        assert!(!device.unregister_callback(0, id));
        assert!(device.register_callback(9, |_| {}).is_none());
    }

    #[tokio::test]
    async fn test_master_and_segment_channels() {
        let (banlanx, _handle) = device(Arc::new(BanlanX::sp602e()));
        assert_eq!(banlanx.channels(), vec![0, 1, 2, 3, 4]);

        let (single, _handle) = device(Arc::new(LedHue::sp110e()));
        assert_eq!(single.channels(), vec![0]);
    }

    #[tokio::test]
    async fn test_mesh_nodes_added_on_demand() {
        let (device, _handle) = device(Arc::new(Zengge::new()));
        assert_eq!(device.channels(), vec![0]);
        let mut events = device.subscribe();

        let mut payload = vec![0u8; 7];
        payload.extend_from_slice(&[0xDC, 0x11, 0x02]);
        payload.extend_from_slice(&[0x11, 0x01, 100, 0x00, 0x00]);
        payload.extend_from_slice(&[0x12, 0x00, 0, 0x00, 0x00]);
        let report = device.model().decode(&payload, None).unwrap();
        device.state.apply(report);

        assert_eq!(device.channels(), vec![0, 0x11, 0x12]);
        let node = device.channel_state(0x11).unwrap();
        assert_eq!(node.status.get_bool(Attribute::Power), Some(true));
        assert!(device.capabilities(0x11).unwrap().contains(&Attribute::Brightness));
        assert_eq!(
            events.recv().await,
            Some(Event::StatusUpdated {
                channels: vec![0x11, 0x12]
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_picks_the_answering_model() {
        let (device, handle) = answering_sp110e();
        assert_eq!(device.channels(), vec![0]);
        device.switch_model(Arc::new(BanlanX::sp602e())).await;
        assert_eq!(device.channels().len(), 5);

        let candidates: Vec<Arc<dyn ModelDescriptor>> =
            vec![Arc::new(BanlanX::sp602e()), Arc::new(LedHue::sp110e())];
        let resolved = device.resolve(candidates).await.unwrap();
        assert_eq!(resolved.map(|m| m.name().to_string()), Some("SP110E".into()));
        assert_eq!(device.model().name(), "SP110E");
        assert_eq!(device.channels(), vec![0]);
        // The failed attempt was stopped before the next one connected
        assert_eq!(handle.connects(), 2);
        assert_eq!(handle.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_restores_original_when_nothing_answers() {
        let (device, _handle) = device(Arc::new(LedHue::sp110e()));
        let candidates: Vec<Arc<dyn ModelDescriptor>> =
            vec![Arc::new(BanlanX::sp602e()), Arc::new(BanlanX::sp608e())];

        assert!(device.resolve(candidates).await.unwrap().is_none());
        assert_eq!(device.model().name(), "SP110E");
        assert!(!device.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let (device, handle) = answering_sp110e();
        assert!(device.update(None).await.unwrap());
        device.stop().await.unwrap();
        device.stop().await.unwrap();
        assert_eq!(handle.disconnects(), 1);
        assert_eq!(device.session_state(), SessionState::Disconnected);
    }

    #[test]
    fn test_unknown_channel_view() {
        let (device, _handle) = device(Arc::new(LedHue::sp110e()));
        assert!(device.channel_state(3).is_none());
        assert!(device.capabilities(3).is_none());
        assert!(!device.supports_effect(3, "Solid"));
    }
}
