//! Connection lifecycle of one device.
//!
//! ```text
//! Disconnected ─connect─▶ Connecting ─resolve─▶ CharacteristicsResolved
//!      ▲                                               │ pair
//!      │                                               ▼
//!      └── Disconnecting ◀─idle / stop / error── Subscribed ◀─subscribe─ Paired
//! ```
//!
//! A single connect lock serializes transitions out of `Disconnected`; a
//! single operation lock serializes outbound commands. Inbound traffic is
//! drained by a receiver task per session that reassembles frames, opens
//! mesh packets and decodes status without taking either lock. The same
//! task owns the idle timer: every successful operation pushes the
//! deadline out, and an expiry that finds an operation in flight is
//! rescheduled instead of disconnecting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;

use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher};
use crate::mesh::{MeshCrypto, MeshSession};
use crate::model::{Command, Context, Endpoints, ModelDescriptor, Pairing, StatusReport, Target};
use crate::protocol::frame::FrameCodec;
use crate::retry::RetryPolicy;
use crate::transport::{Inbound, Transport};
use crate::types::{DeviceIdentity, MacAddress};

/// Capacity of the inbound packet queue.
pub const INBOUND_CAPACITY: usize = 64;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    CharacteristicsResolved,
    Paired,
    /// Notifications are flowing; the session is usable.
    Subscribed,
    Disconnecting,
}

impl SessionState {
    /// Returns true once subscribed.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Subscribed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::CharacteristicsResolved => "characteristics resolved",
            Self::Paired => "paired",
            Self::Subscribed => "subscribed",
            Self::Disconnecting => "disconnecting",
        })
    }
}

/// Receives decoded status from the session.
pub trait StatusSink: Send + Sync {
    /// Descriptor context to decode against.
    fn context(&self) -> Option<Context>;

    /// Applies one decoded payload. Must not block.
    fn apply(&self, report: StatusReport);
}

enum Control {
    /// An operation succeeded; push the idle deadline out.
    Touch,
}

/// Resources that exist only between connect and disconnect.
struct Live {
    epoch: u64,
    endpoints: Endpoints,
    mesh: Option<Arc<MeshSession>>,
    primed: bool,
    control: mpsc::Sender<Control>,
}

struct Inner<T> {
    name: String,
    address: String,
    mac: Option<MacAddress>,
    config: DeviceConfig,
    model: StdMutex<Arc<dyn ModelDescriptor>>,
    transport: Mutex<T>,
    connect_lock: Mutex<()>,
    operation_lock: Arc<Mutex<()>>,
    state: watch::Sender<SessionState>,
    live: StdMutex<Option<Live>>,
    epoch: AtomicU64,
    faults: AtomicU64,
    dispatcher: EventDispatcher,
    sink: Arc<dyn StatusSink>,
}

/// Owns the transport and drives the connection state machine.
pub struct SessionManager<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SessionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport + 'static> SessionManager<T> {
    /// Creates a disconnected session manager.
    #[must_use]
    pub fn new(
        identity: &DeviceIdentity,
        model: Arc<dyn ModelDescriptor>,
        transport: T,
        config: DeviceConfig,
        dispatcher: EventDispatcher,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                name: identity.display_name().to_string(),
                address: identity.address.clone(),
                mac: identity.mac().ok(),
                config,
                model: StdMutex::new(model),
                transport: Mutex::new(transport),
                connect_lock: Mutex::new(()),
                operation_lock: Arc::new(Mutex::new(())),
                state,
                live: StdMutex::new(None),
                epoch: AtomicU64::new(0),
                faults: AtomicU64::new(0),
                dispatcher,
                sink,
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watches state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Returns true while subscribed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Decode faults seen since creation.
    #[must_use]
    pub fn protocol_faults(&self) -> u64 {
        self.inner.faults.load(Ordering::Relaxed)
    }

    /// Active model descriptor.
    #[must_use]
    pub fn model(&self) -> Arc<dyn ModelDescriptor> {
        self.inner.model()
    }

    /// Swaps the model descriptor. Takes effect on the next connect.
    pub fn set_model(&self, model: Arc<dyn ModelDescriptor>) {
        *self
            .inner
            .model
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = model;
    }

    /// Establishes a session unless one is already up.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Sends frames through the retry policy.
    ///
    /// `retry` overrides the configured retry count. Model priming frames
    /// go ahead of the first command of a new session. A terminal failure
    /// tears the session down so the next call starts from a clean state.
    pub async fn send(&self, commands: &[Command], retry: Option<u8>) -> Result<()> {
        self.inner.send(commands, retry).await
    }

    /// Graceful teardown. Waits for an operation in flight; idempotent.
    pub async fn stop(&self) -> Result<()> {
        let _operation = self.inner.operation_lock.lock().await;
        self.inner.teardown(None, false).await
    }

    #[cfg(test)]
    pub(crate) async fn hold_operation(&self) -> tokio::sync::OwnedMutexGuard<()> {
        Arc::clone(&self.inner.operation_lock).lock_owned().await
    }
}

impl<T> fmt::Debug for SessionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("name", &self.inner.name)
            .field("state", &*self.inner.state.borrow())
            .field("faults", &self.inner.faults.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> Inner<T> {
    fn live(&self) -> MutexGuard<'_, Option<Live>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn model(&self) -> Arc<dyn ModelDescriptor> {
        Arc::clone(&self.model.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::trace!("{}: {} -> {}", self.name, previous, state);
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let _connect = self.connect_lock.lock().await;

        let epoch = self.live().as_ref().map(|live| live.epoch);
        if let Some(epoch) = epoch {
            if self.transport.lock().await.is_connected() {
                return Ok(());
            }
            self.lost(epoch).await;
        }

        self.set_state(SessionState::Connecting);
        tracing::info!("{}: Connecting", self.name);
        let model = self.model();
        let mut transport = self.transport.lock().await;
        // No live session, so a link the transport still holds is stale
        if transport.is_connected() {
            tracing::debug!("{}: Dropping stale link", self.name);
            if let Err(e) = transport.disconnect().await {
                tracing::debug!("{}: Disconnect of stale link: {}", self.name, e);
            }
        }
        if let Err(error) = transport.connect().await {
            tracing::warn!("{}: Connect failed: {}", self.name, error);
            self.set_state(SessionState::Disconnected);
            return Err(error);
        }

        if let Err(error) = self.establish(&mut transport, &model).await {
            if error.invalidates_session() {
                transport.clear_cache();
            }
            if let Err(e) = transport.disconnect().await {
                tracing::debug!("{}: Disconnect after failed setup: {}", self.name, e);
            }
            self.set_state(SessionState::Disconnected);
            return Err(error);
        }
        Ok(())
    }

    async fn establish(self: &Arc<Self>, transport: &mut T, model: &Arc<dyn ModelDescriptor>) -> Result<()> {
        let endpoints = model.endpoints();
        let offered = transport.endpoints();
        if let Some(missing) = endpoints
            .mandatory()
            .into_iter()
            .find(|endpoint| !offered.contains(endpoint))
        {
            tracing::error!("{}: Required characteristic {} not found", self.name, missing);
            return Err(Error::CharacteristicMissing {
                uuid: missing.to_string(),
            });
        }
        self.set_state(SessionState::CharacteristicsResolved);

        let mesh = match model.pairing() {
            Pairing::None => None,
            Pairing::Mesh => Some(Arc::new(self.pair(transport, &endpoints).await?)),
        };
        self.set_state(SessionState::Paired);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        transport.subscribe(endpoints.notify, inbound_tx).await?;

        let (control_tx, control_rx) = mpsc::channel(4);
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let receiver = Receiver {
            inner: Arc::downgrade(self),
            name: self.name.clone(),
            epoch,
            codec: FrameCodec::new(model.framing()),
            model: Arc::clone(model),
            mesh: mesh.clone(),
            idle_timeout: self.config.idle_timeout(),
        };
        tokio::spawn(receiver.run(inbound_rx, control_rx));

        for command in model.on_subscribe() {
            self.write_frame(transport, &endpoints, mesh.as_deref(), &command)
                .await?;
        }

        *self.live() = Some(Live {
            epoch,
            endpoints,
            mesh,
            primed: false,
            control: control_tx,
        });
        self.set_state(SessionState::Subscribed);
        tracing::info!("{}: Connected", self.name);
        self.dispatcher.dispatch(Event::Connected);
        Ok(())
    }

    async fn pair(&self, transport: &mut T, endpoints: &Endpoints) -> Result<MeshSession> {
        let pair = endpoints.pair.ok_or_else(|| Error::CharacteristicMissing {
            uuid: "pair".into(),
        })?;
        let mac = self.mac.ok_or_else(|| Error::TransportNotFound {
            address: self.address.clone(),
        })?;

        let crypto = MeshCrypto::new(self.config.mesh());
        let request = crypto.pair_request();
        tracing::debug!("{}: Pair request {}", self.name, hex::encode(request.packet()));
        transport.write(pair, request.packet().clone()).await?;
        tokio::time::sleep(self.config.pair_delay()).await;
        let reply = transport.read(pair).await?;
        tracing::debug!("{}: Pair reply {}", self.name, hex::encode(&reply));

        match crypto.complete(&request, &reply, mac) {
            Ok(session) => {
                tracing::info!("{}: Paired with mesh '{}'", self.name, self.config.mesh().name);
                Ok(session)
            }
            Err(error) => {
                tracing::error!("{}: Pairing failed: {}", self.name, error);
                Err(error)
            }
        }
    }

    async fn write_frame(
        &self,
        transport: &mut T,
        endpoints: &Endpoints,
        mesh: Option<&MeshSession>,
        command: &Command,
    ) -> Result<()> {
        let (endpoint, data) = match (command.target, mesh) {
            (Target::Write, Some(mesh)) => (endpoints.write, mesh.seal(&command.data)?),
            (Target::Write, None) => (endpoints.write, command.data.clone()),
            (Target::Notify, _) => (endpoints.notify, command.data.clone()),
        };
        tracing::debug!(
            "{}: Write {} to {}",
            self.name,
            hex::encode(&command.data),
            endpoint
        );
        transport.write(endpoint, data).await
    }

    async fn send(self: &Arc<Self>, commands: &[Command], retry: Option<u8>) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let policy = RetryPolicy::new(retry.unwrap_or(self.config.retry_count()))
            .backoff(self.config.backoff());
        let max_attempts = policy.max_attempts();

        let result = policy
            .run(|attempt| self.attempt(commands, attempt + 1, max_attempts))
            .await;

        if let Err(ref error) = result {
            tracing::warn!("{}: Send failed, resetting session: {}", self.name, error);
            let _operation = self.operation_lock.lock().await;
            if let Err(e) = self.teardown(None, error.invalidates_session()).await {
                tracing::debug!("{}: Teardown after failure: {}", self.name, e);
            }
        }
        result
    }

    async fn attempt(self: &Arc<Self>, commands: &[Command], attempt: u32, max_attempts: u32) -> Result<()> {
        self.connect().await?;
        let _operation = self.operation_lock.lock().await;

        let snapshot = self.live().as_ref().map(|live| {
            (
                live.epoch,
                live.endpoints,
                live.mesh.clone(),
                live.primed,
                live.control.clone(),
            )
        });
        let Some((epoch, endpoints, mesh, primed, control)) = snapshot else {
            return Err(Error::NotConnected);
        };

        let mut frames = Vec::with_capacity(commands.len() + 1);
        if !primed {
            frames.extend(self.model().on_connect());
        }
        frames.extend_from_slice(commands);

        tracing::debug!(
            "{}: Send {} command(s), attempt {} of {}",
            self.name,
            frames.len(),
            attempt,
            max_attempts
        );
        let mut transport = self.transport.lock().await;
        for (index, frame) in frames.iter().enumerate() {
            if index > 0 && !self.config.settle_delay().is_zero() {
                tokio::time::sleep(self.config.settle_delay()).await;
            }
            self.write_frame(&mut transport, &endpoints, mesh.as_deref(), frame)
                .await?;
        }
        drop(transport);

        if let Some(live) = self.live().as_mut().filter(|live| live.epoch == epoch) {
            live.primed = true;
        }
        // A full queue already holds a pending touch
        let _ = control.try_send(Control::Touch);
        Ok(())
    }

    /// Tears down the live session, if it belongs to `epoch` when given.
    async fn teardown(&self, epoch: Option<u64>, clear_cache: bool) -> Result<()> {
        let live = {
            let mut guard = self.live();
            if epoch.is_none() || guard.as_ref().map(|live| live.epoch) == epoch {
                guard.take()
            } else {
                None
            }
        };
        let Some(live) = live else {
            if clear_cache {
                self.transport.lock().await.clear_cache();
            }
            self.set_state(SessionState::Disconnected);
            return Ok(());
        };

        self.set_state(SessionState::Disconnecting);
        tracing::info!("{}: Disconnecting", self.name);
        let mut transport = self.transport.lock().await;
        if clear_cache {
            transport.clear_cache();
        }
        let result = transport.disconnect().await;
        drop(transport);
        // Dropping the live session discards the mesh key and stops the receiver
        drop(live);

        self.set_state(SessionState::Disconnected);
        self.dispatcher
            .dispatch(Event::Disconnected { expected: true });
        result
    }

    /// The link dropped on its own. The transport is released so that the
    /// next connect starts from scratch.
    async fn lost(&self, epoch: u64) {
        let live = {
            let mut guard = self.live();
            if guard.as_ref().is_some_and(|live| live.epoch == epoch) {
                guard.take()
            } else {
                None
            }
        };
        if live.is_some() {
            tracing::warn!("{}: Disconnected unexpectedly", self.name);
            if let Err(e) = self.transport.lock().await.disconnect().await {
                tracing::debug!("{}: Release after link loss: {}", self.name, e);
            }
            self.set_state(SessionState::Disconnected);
            self.dispatcher
                .dispatch(Event::Disconnected { expected: false });
        }
    }

    fn fault(&self, error: &Error) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("{}: Protocol fault: {}", self.name, error);
        self.dispatcher.dispatch(Event::ProtocolFault {
            message: error.to_string(),
        });
    }
}

/// Drains inbound packets and runs the idle timer of one session.
struct Receiver<T> {
    inner: Weak<Inner<T>>,
    name: String,
    epoch: u64,
    codec: FrameCodec,
    model: Arc<dyn ModelDescriptor>,
    mesh: Option<Arc<MeshSession>>,
    idle_timeout: Duration,
}

impl<T: Transport + 'static> Receiver<T> {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut control: mpsc::Receiver<Control>,
    ) {
        let mut deadline = Instant::now() + self.idle_timeout;
        loop {
            tokio::select! {
                message = control.recv() => match message {
                    Some(Control::Touch) => deadline = Instant::now() + self.idle_timeout,
                    None => break,
                },
                packet = inbound.recv() => match packet {
                    Some(Inbound::Packet(data)) => self.handle(&data),
                    Some(Inbound::Closed) | None => {
                        if let Some(inner) = self.inner.upgrade() {
                            inner.lost(self.epoch).await;
                        }
                        break;
                    }
                },
                () = tokio::time::sleep_until(deadline) => {
                    let Some(inner) = self.inner.upgrade() else {
                        break;
                    };
                    if let Ok(_operation) = Arc::clone(&inner.operation_lock).try_lock_owned() {
                        tracing::info!(
                            "{}: Idle for {:?}, disconnecting",
                            self.name,
                            self.idle_timeout
                        );
                        if let Err(e) = inner.teardown(Some(self.epoch), false).await {
                            tracing::warn!("{}: Idle disconnect failed: {}", self.name, e);
                        }
                        break;
                    }
                    tracing::debug!("{}: Operation in flight, idle disconnect deferred", self.name);
                    deadline = Instant::now() + self.idle_timeout;
                }
            }
        }
        tracing::trace!("{}: Receiver stopped", self.name);
    }

    fn handle(&mut self, data: &Bytes) {
        tracing::trace!("{}: Packet {}", self.name, hex::encode(data));
        let packet = match &self.mesh {
            Some(mesh) => match mesh.open(data) {
                Ok(opened) => opened,
                Err(e) => return self.fault(&e.into()),
            },
            None => data.clone(),
        };

        let mut next = self.codec.feed(&packet);
        loop {
            match next {
                Ok(Some(payload)) => self.decode(&payload),
                Ok(None) => break,
                Err(e) => {
                    self.fault(&e.into());
                    break;
                }
            }
            next = self.codec.poll();
        }
    }

    fn decode(&self, payload: &[u8]) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let context = inner.sink.context();
        match self.model.decode(payload, context.as_ref()) {
            Ok(report) => {
                tracing::debug!("{}: Status {}", self.name, hex::encode(payload));
                inner.sink.apply(report);
            }
            Err(e) => inner.fault(&e),
        }
    }

    fn fault(&self, error: &Error) {
        if let Some(inner) = self.inner.upgrade() {
            inner.fault(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelView, Status};
    use crate::event::{EventFilter, EventKind, Subscription};
    use crate::mesh::MeshCredentials;
    use crate::mesh::tests::{MAC, SimulatedNode};
    use crate::model::{LedHue, Zengge};
    use crate::transport::{Endpoint, MemoryHandle, MemoryTransport, Reply};
    use crate::types::{Attribute, Value};

    const FFE1: Endpoint = Endpoint::short(0xFFE1);
    const STATUS: [u8; 12] = [0x01, 0x79, 0x10, 0x80, 0x03, 0x03, 0x00, 0x3C, 0x10, 0x20, 0x30, 0x00];

    #[derive(Default)]
    struct Recorder {
        reports: StdMutex<Vec<StatusReport>>,
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.reports.lock().unwrap().len()
        }
    }

    impl StatusSink for Recorder {
        fn context(&self) -> Option<Context> {
            None
        }

        fn apply(&self, report: StatusReport) {
            self.reports.lock().unwrap().push(report);
        }
    }

    struct Fixture {
        session: SessionManager<MemoryTransport>,
        handle: MemoryHandle,
        recorder: Arc<Recorder>,
        events: Subscription,
    }

    /// `RUST_LOG=uniled=trace` shows session traffic in failing tests.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn fixture(model: Arc<dyn ModelDescriptor>, identity: &DeviceIdentity, endpoints: Vec<Endpoint>) -> Fixture {
        init_tracing();
        let (transport, handle) = MemoryTransport::new(endpoints);
        let recorder = Arc::new(Recorder::default());
        let dispatcher = EventDispatcher::default();
        let events = dispatcher.subscribe();
        let session = SessionManager::new(
            identity,
            model,
            transport,
            DeviceConfig::new(),
            dispatcher,
            Arc::clone(&recorder) as Arc<dyn StatusSink>,
        );
        Fixture {
            session,
            handle,
            recorder,
            events,
        }
    }

    fn sp110e() -> Fixture {
        fixture(
            Arc::new(LedHue::sp110e()),
            &DeviceIdentity::ble("AA:BB:CC:DD:EE:FF"),
            vec![FFE1],
        )
    }

    fn power_on() -> Command {
        Command::write(vec![0, 0, 0, 0xAA])
    }

    async fn next_kind(events: &mut Subscription, kind: EventKind) -> Option<Event> {
        events
            .wait_for(&EventFilter::kinds(vec![kind]), Duration::from_secs(1))
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_subscribes() {
        let mut f = sp110e();
        assert_eq!(f.session.state(), SessionState::Disconnected);

        f.session.connect().await.unwrap();
        assert_eq!(f.session.state(), SessionState::Subscribed);
        assert!(f.handle.is_subscribed());
        assert_eq!(next_kind(&mut f.events, EventKind::Connected).await, Some(Event::Connected));

        // Already up, no second connect
        f.session.connect().await.unwrap();
        assert_eq!(f.handle.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_is_fatal() {
        let f = fixture(
            Arc::new(LedHue::sp110e()),
            &DeviceIdentity::ble("AA:BB:CC:DD:EE:FF"),
            vec![Endpoint::short(0xFFE2)],
        );

        let result = f.session.send(&[power_on()], Some(3)).await;
        assert!(matches!(result, Err(Error::CharacteristicMissing { .. })));
        assert_eq!(f.session.state(), SessionState::Disconnected);
        assert!(!f.handle.is_subscribed());
        assert!(!f.handle.is_connected());
        assert!(f.handle.cache_clears() >= 1);
        // Fatal, so a single connect attempt
        assert_eq!(f.handle.connects(), 1);
        assert!(f.handle.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_disconnects() {
        let mut f = sp110e();
        f.session.send(&[power_on()], None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(f.session.is_connected());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.session.state(), SessionState::Disconnected);
        assert_eq!(f.handle.disconnects(), 1);
        assert_eq!(
            next_kind(&mut f.events, EventKind::Disconnected).await,
            Some(Event::Disconnected { expected: true })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_send_resets_idle_timer() {
        let f = sp110e();
        f.session.send(&[power_on()], None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(8)).await;
        f.session.send(&[power_on()], None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(f.session.is_connected());

        // Notifications alone do not keep the session alive
        f.handle.notify(STATUS.to_vec());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!f.session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_deferred_while_operation_in_flight() {
        let f = sp110e();
        f.session.connect().await.unwrap();

        let guard = f.session.hold_operation().await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(f.session.is_connected());
        assert_eq!(f.handle.disconnects(), 0);
        drop(guard);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_disconnect_reconnects_on_next_send() {
        let mut f = sp110e();
        f.session.connect().await.unwrap();

        f.handle.close();
        assert_eq!(
            next_kind(&mut f.events, EventKind::Disconnected).await,
            Some(Event::Disconnected { expected: false })
        );
        assert_eq!(f.session.state(), SessionState::Disconnected);

        f.session.send(&[power_on()], Some(0)).await.unwrap();
        assert_eq!(f.handle.connects(), 2);
        assert!(f.session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_releases_stale_link() {
        let mut f = sp110e();
        f.session.connect().await.unwrap();

        f.handle.drop_link();
        assert_eq!(
            next_kind(&mut f.events, EventKind::Disconnected).await,
            Some(Event::Disconnected { expected: false })
        );
        assert_eq!(f.session.state(), SessionState::Disconnected);
        assert!(!f.handle.is_connected());
        assert_eq!(f.handle.disconnects(), 1);

        // A single attempt is enough once the stale link is gone
        f.session.send(&[power_on()], Some(0)).await.unwrap();
        assert_eq!(f.handle.connects(), 2);
        assert!(f.handle.is_subscribed());
        assert_eq!(f.handle.writes_to(FFE1), vec![power_on().data]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_and_faults() {
        let mut f = sp110e();
        f.session.connect().await.unwrap();

        f.handle.notify(vec![0x01, 0x02]);
        let fault = next_kind(&mut f.events, EventKind::ProtocolFault).await;
        assert!(matches!(fault, Some(Event::ProtocolFault { .. })));
        assert_eq!(f.session.protocol_faults(), 1);
        assert_eq!(f.recorder.count(), 0);

        // The pipeline survives the fault
        f.handle.notify(STATUS.to_vec());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.recorder.count(), 1);
        let reports = f.recorder.reports.lock().unwrap();
        let status = &reports[0].channel(0).unwrap().status;
        assert_eq!(status.get_bool(Attribute::Power), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_resets() {
        let f = sp110e();
        f.handle.fail_writes(2);
        f.session.send(&[power_on()], Some(3)).await.unwrap();
        assert_eq!(f.handle.writes_to(FFE1).len(), 1);

        f.handle.fail_writes(10);
        let result = f.session.send(&[power_on()], Some(1)).await;
        assert!(matches!(result, Err(Error::Transport { .. })));
        assert_eq!(f.session.state(), SessionState::Disconnected);
        assert_eq!(f.handle.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let f = sp110e();
        f.handle.fail_connects(1, || Error::TransportNotFound {
            address: "AA:BB:CC:DD:EE:FF".into(),
        });
        let result = f.session.send(&[power_on()], Some(3)).await;
        assert!(matches!(result, Err(Error::TransportNotFound { .. })));
        assert_eq!(f.handle.connects(), 0);
        assert_eq!(f.session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priming_and_settle_delay() {
        let f = fixture(
            Arc::new(LedHue::sp110e_legacy()),
            &DeviceIdentity::ble("AA:BB:CC:DD:EE:FF"),
            vec![FFE1],
        );

        let started = Instant::now();
        f.session.send(&[power_on()], None).await.unwrap();
        let writes = f.handle.writes_to(FFE1);
        assert_eq!(writes.len(), 2);
        assert_ne!(writes[0], power_on().data);
        assert_eq!(writes[1], power_on().data);
        assert!(started.elapsed() >= DeviceConfig::new().settle_delay());

        f.handle.clear_writes();
        f.session.send(&[power_on()], None).await.unwrap();
        assert_eq!(f.handle.writes_to(FFE1), vec![power_on().data]);

        // A new session is primed again
        f.session.stop().await.unwrap();
        f.handle.clear_writes();
        f.session.send(&[power_on()], None).await.unwrap();
        assert_eq!(f.handle.writes_to(FFE1).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let mut f = sp110e();
        f.session.connect().await.unwrap();
        f.session.stop().await.unwrap();
        f.session.stop().await.unwrap();
        assert_eq!(f.handle.disconnects(), 1);
        assert_eq!(
            next_kind(&mut f.events, EventKind::Disconnected).await,
            Some(Event::Disconnected { expected: true })
        );
    }

    fn mesh_fixture(node: SimulatedNode) -> (Fixture, Endpoints) {
        let model = Zengge::new();
        let endpoints = model.endpoints();
        let pair = endpoints.pair.unwrap();
        let f = fixture(
            Arc::new(model),
            &DeviceIdentity::mesh(MAC.to_string()),
            vec![endpoints.write, endpoints.notify, pair],
        );
        f.handle.respond(move |endpoint, data| {
            if endpoint == pair {
                vec![Reply::Readable(pair, Bytes::from(node.reply(data)))]
            } else {
                Vec::new()
            }
        });
        (f, endpoints)
    }

    #[tokio::test(start_paused = true)]
    async fn test_mesh_pairing_and_sealing() {
        let credentials = MeshCredentials::default();
        let node = SimulatedNode::new(&credentials);
        let (f, endpoints) = mesh_fixture(SimulatedNode::new(&credentials));

        f.session.connect().await.unwrap();
        assert!(f.session.is_connected());
        assert_eq!(f.handle.writes_to(endpoints.notify), vec![Bytes::from_static(&[0x01])]);

        let request = f.handle.writes_to(endpoints.pair.unwrap())[0].clone();
        let key = node.session_key(&request[1..9]);

        let model = f.session.model();
        let commands = model
            .encode(&ChannelView::new(0, Status::new()), Attribute::Power, &Value::from(true))
            .unwrap();
        f.session.send(&commands, None).await.unwrap();
        let sealed = f.handle.writes_to(endpoints.write)[0].clone();
        let received = node.receive(&key, &sealed).unwrap();
        assert_eq!(&received[..3], &commands[0].data[..3]);
        assert_eq!(&received[3..5], &0x0211u16.to_le_bytes());

        let mut body = vec![0xDC, 0x11, 0x02, 0x11, 0x01, 100, 0x00, 0x00];
        body.extend_from_slice(&[0; 5]);
        f.handle
            .notify(node.notify(&key, [0x01, 0x02, 0x03, 0x00, 0x00], &body));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.recorder.count(), 1);

        // Tampered packets are faults, never status
        let mut tampered = node.notify(&key, [0x01, 0x02, 0x04, 0x00, 0x00], &body);
        tampered[6] ^= 0xFF;
        f.handle.notify(tampered);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.recorder.count(), 1);
        assert_eq!(f.session.protocol_faults(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mesh_rejected_credentials() {
        let node = SimulatedNode::new(&MeshCredentials::new("OtherMesh", "secret", 0x0211));
        let (f, endpoints) = mesh_fixture(node);

        let result = f.session.send(&[Command::write(vec![0xFF, 0xFF, 0xD0])], Some(3)).await;
        assert!(matches!(result, Err(Error::PairingRejected)));
        assert_eq!(f.session.state(), SessionState::Disconnected);
        assert_eq!(f.handle.connects(), 1);
        assert!(f.handle.cache_clears() >= 1);
        assert!(f.handle.writes_to(endpoints.write).is_empty());
        assert!(!f.handle.is_subscribed());
    }
}
