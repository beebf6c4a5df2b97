//! Event system for device notifications.
//!
//! Session and facade publish [`Event`]s on a broadcast channel. Any number
//! of [`Subscription`]s may listen; a subscriber that falls behind skips
//! the events it missed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

/// Default broadcast capacity.
pub const DEFAULT_CAPACITY: usize = 64;

/// Event types that can be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Session established and subscribed.
    Connected,
    /// Session torn down.
    Disconnected {
        /// False if the link dropped without being asked to.
        expected: bool,
    },
    /// Decoded status was applied to these channels.
    StatusUpdated { channels: Vec<u8> },
    /// An inbound packet could not be reassembled or decoded.
    ProtocolFault { message: String },
}

/// Discriminant of an [`Event`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    StatusUpdated,
    ProtocolFault,
}

impl Event {
    /// Returns the kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::StatusUpdated { .. } => EventKind::StatusUpdated,
            Self::ProtocolFault { .. } => EventKind::ProtocolFault,
        }
    }
}

/// Subscription filter for specific event types.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by kind.
    pub kinds: Option<Vec<EventKind>>,
    /// Filter status updates by channel.
    pub channel: Option<u8>,
}

impl EventFilter {
    /// Creates a filter for specific kinds.
    #[must_use]
    pub const fn kinds(kinds: Vec<EventKind>) -> Self {
        Self {
            kinds: Some(kinds),
            channel: None,
        }
    }

    /// Creates a filter for status updates of any channel.
    #[must_use]
    pub fn status() -> Self {
        Self::kinds(vec![EventKind::StatusUpdated])
    }

    /// Creates a filter for status updates touching `channel`.
    #[must_use]
    pub fn channel(channel: u8) -> Self {
        Self {
            channel: Some(channel),
            ..Self::status()
        }
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }

        if let Some(expected) = self.channel {
            return matches!(event, Event::StatusUpdated { channels } if channels.contains(&expected));
        }

        true
    }
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Receives the next event. Returns `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("subscriber lagged, {} event(s) skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Waits for an event matching the filter.
    ///
    /// Returns `None` if the timeout expires or the channel is closed.
    pub async fn wait_for(&mut self, filter: &EventFilter, timeout: Duration) -> Option<Event> {
        tokio::select! {
            biased;
            result = async {
                while let Some(event) = self.recv().await {
                    if filter.matches(&event) {
                        return Some(event);
                    }
                }
                None
            } => result,
            () = tokio::time::sleep(timeout) => None,
        }
    }
}

struct EventDispatcherInner {
    sender: broadcast::Sender<Event>,
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<EventDispatcherInner>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(EventDispatcherInner { sender }),
        }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        // No receivers is fine
        let _ = self.inner.sender.send(event);
    }

    /// Subscribes to events.
    ///
    /// Subscribe before sending a request whose reply you want to see; only
    /// events dispatched after this call are delivered.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.inner.sender.subscribe(),
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.inner.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_dispatch() {
        let dispatcher = EventDispatcher::new(16);
        let mut sub = dispatcher.subscribe();

        dispatcher.dispatch(Event::Connected);

        let event = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .unwrap();

        assert_eq!(event, Some(Event::Connected));
    }

    #[test]
    fn test_event_filter() {
        let filter = EventFilter::kinds(vec![EventKind::Connected, EventKind::Disconnected]);

        assert!(filter.matches(&Event::Connected));
        assert!(filter.matches(&Event::Disconnected { expected: false }));
        assert!(!filter.matches(&Event::ProtocolFault {
            message: "test".into()
        }));
        assert!(EventFilter::default().matches(&Event::Connected));
    }

    #[test]
    fn test_channel_filter() {
        let filter = EventFilter::channel(2);

        assert!(filter.matches(&Event::StatusUpdated {
            channels: vec![0, 2]
        }));
        assert!(!filter.matches(&Event::StatusUpdated { channels: vec![1] }));
        assert!(!filter.matches(&Event::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_skips_and_times_out() {
        let dispatcher = EventDispatcher::new(16);
        let mut sub = dispatcher.subscribe();

        dispatcher.dispatch(Event::Connected);
        dispatcher.dispatch(Event::StatusUpdated { channels: vec![0] });

        let event = sub
            .wait_for(&EventFilter::status(), Duration::from_secs(1))
            .await;
        assert_eq!(event, Some(Event::StatusUpdated { channels: vec![0] }));

        let started = tokio::time::Instant::now();
        assert!(sub
            .wait_for(&EventFilter::status(), Duration::from_secs(2))
            .await
            .is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
