//! In-process transport.
//!
//! [`MemoryTransport`] stands in for a radio or socket. Its paired
//! [`MemoryHandle`] plays the device: it records writes, injects
//! notifications and disconnects, fails connects and writes on demand, and
//! can answer writes through a responder closure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::transport::{Endpoint, Inbound, Transport, TransportFuture};

/// What the simulated device does in response to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Deliver a notification to the subscriber.
    Notify(Bytes),
    /// Make a value readable from an endpoint.
    Readable(Endpoint, Bytes),
    /// Drop the link.
    Close,
}

/// Answers a write with zero or more replies.
pub type Responder = Box<dyn FnMut(Endpoint, &[u8]) -> Vec<Reply> + Send>;

type ErrorFactory = Box<dyn FnMut() -> Error + Send>;

#[derive(Default)]
struct PeerState {
    connected: bool,
    stale: bool,
    endpoints: Vec<Endpoint>,
    writes: Vec<(Endpoint, Bytes)>,
    readable: HashMap<Endpoint, Bytes>,
    subscriber: Option<mpsc::Sender<Inbound>>,
    responder: Option<Responder>,
    connect_failures: u32,
    connect_error: Option<ErrorFactory>,
    write_failures: u32,
    connects: u32,
    disconnects: u32,
    cache_clears: u32,
}

impl PeerState {
    fn deliver(&mut self, inbound: Inbound) -> bool {
        match &self.subscriber {
            Some(tx) => tx.try_send(inbound).is_ok(),
            None => false,
        }
    }

    fn apply(&mut self, replies: Vec<Reply>) {
        for reply in replies {
            match reply {
                Reply::Notify(data) => {
                    if !self.deliver(Inbound::Packet(data)) {
                        tracing::debug!("memory: notification dropped, no subscriber");
                    }
                }
                Reply::Readable(endpoint, data) => {
                    self.readable.insert(endpoint, data);
                }
                Reply::Close => self.close(),
            }
        }
    }

    fn close(&mut self) {
        if self.connected {
            self.deliver(Inbound::Closed);
        }
        self.connected = false;
        self.subscriber = None;
    }

    fn drop_link(&mut self) {
        if self.connected {
            self.deliver(Inbound::Closed);
            self.stale = true;
        }
        self.subscriber = None;
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<PeerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Transport backed by an in-process simulated device.
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    /// Creates a transport offering `endpoints`, and the handle driving it.
    #[must_use]
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> (Self, MemoryHandle) {
        let shared = Arc::new(Shared::default());
        shared.lock().endpoints = endpoints.into_iter().collect();
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MemoryHandle { shared },
        )
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.shared.lock();
            if state.connected {
                return Ok(());
            }
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                let error = state
                    .connect_error
                    .as_mut()
                    .map_or_else(|| Error::transport("connect failed"), |make| make());
                return Err(error);
            }
            state.connected = true;
            state.connects += 1;
            Ok(())
        })
    }

    fn disconnect(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.shared.lock();
            if state.connected {
                state.disconnects += 1;
            }
            state.connected = false;
            state.stale = false;
            state.subscriber = None;
            Ok(())
        })
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.shared.lock().endpoints.clone()
    }

    fn write(&mut self, endpoint: Endpoint, data: Bytes) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.shared.lock();
            if !state.connected {
                return Err(Error::NotConnected);
            }
            if state.stale {
                return Err(Error::transport("broken pipe"));
            }
            if state.write_failures > 0 {
                state.write_failures -= 1;
                return Err(Error::transport(format!("write to {endpoint} failed")));
            }
            state.writes.push((endpoint, data.clone()));
            let replies = match state.responder.as_mut() {
                Some(responder) => responder(endpoint, &data),
                None => Vec::new(),
            };
            state.apply(replies);
            Ok(())
        })
    }

    fn read(&mut self, endpoint: Endpoint) -> TransportFuture<'_, Bytes> {
        Box::pin(async move {
            let state = self.shared.lock();
            if !state.connected {
                return Err(Error::NotConnected);
            }
            Ok(state.readable.get(&endpoint).cloned().unwrap_or_default())
        })
    }

    fn subscribe(
        &mut self,
        endpoint: Endpoint,
        sender: mpsc::Sender<Inbound>,
    ) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.shared.lock();
            if !state.connected || state.stale {
                return Err(Error::NotConnected);
            }
            if !state.endpoints.contains(&endpoint) {
                return Err(Error::CharacteristicMissing {
                    uuid: endpoint.to_string(),
                });
            }
            state.subscriber = Some(sender);
            Ok(())
        })
    }

    fn clear_cache(&mut self) {
        self.shared.lock().cache_clears += 1;
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }
}

/// Drives the simulated device behind a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<Shared>,
}

impl MemoryHandle {
    /// Installs a responder that answers every write.
    ///
    /// The responder runs under the peer lock and must not call back into
    /// the handle.
    pub fn respond(&self, responder: impl FnMut(Endpoint, &[u8]) -> Vec<Reply> + Send + 'static) {
        self.shared.lock().responder = Some(Box::new(responder));
    }

    /// Delivers a notification. Returns false without a subscriber.
    pub fn notify(&self, data: impl Into<Bytes>) -> bool {
        self.shared.lock().deliver(Inbound::Packet(data.into()))
    }

    /// Drops the link as if the device went away.
    pub fn close(&self) {
        self.shared.lock().close();
    }

    /// Drops the link from the peer side only. The transport keeps
    /// reporting itself connected, as a socket does after the remote end
    /// closed, and writes fail until it is disconnected.
    pub fn drop_link(&self) {
        self.shared.lock().drop_link();
    }

    /// Makes the next `times` connects fail with errors built by `error`.
    pub fn fail_connects(&self, times: u32, error: impl FnMut() -> Error + Send + 'static) {
        let mut state = self.shared.lock();
        state.connect_failures = times;
        state.connect_error = Some(Box::new(error));
    }

    /// Makes the next `times` writes fail.
    pub fn fail_writes(&self, times: u32) {
        self.shared.lock().write_failures = times;
    }

    /// Replaces the offered endpoints.
    pub fn set_endpoints(&self, endpoints: impl IntoIterator<Item = Endpoint>) {
        self.shared.lock().endpoints = endpoints.into_iter().collect();
    }

    /// Sets the value returned by reads of `endpoint`.
    pub fn set_readable(&self, endpoint: Endpoint, data: impl Into<Bytes>) {
        self.shared.lock().readable.insert(endpoint, data.into());
    }

    /// Returns every successful write so far.
    #[must_use]
    pub fn writes(&self) -> Vec<(Endpoint, Bytes)> {
        self.shared.lock().writes.clone()
    }

    /// Returns the data written to `endpoint`.
    #[must_use]
    pub fn writes_to(&self, endpoint: Endpoint) -> Vec<Bytes> {
        self.shared
            .lock()
            .writes
            .iter()
            .filter(|(e, _)| *e == endpoint)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Forgets recorded writes.
    pub fn clear_writes(&self) {
        self.shared.lock().writes.clear();
    }

    /// Returns true while the transport is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    /// Returns true while a subscriber is attached.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.shared.lock().subscriber.is_some()
    }

    /// Number of successful connects.
    #[must_use]
    pub fn connects(&self) -> u32 {
        self.shared.lock().connects
    }

    /// Number of disconnects of a live link.
    #[must_use]
    pub fn disconnects(&self) -> u32 {
        self.shared.lock().disconnects
    }

    /// Number of cache invalidations.
    #[must_use]
    pub fn cache_clears(&self) -> u32 {
        self.shared.lock().cache_clears
    }
}
