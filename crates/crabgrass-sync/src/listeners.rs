use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;

use crabgrass_types::{EventKind, InboundEvent};

/// Locally raised stream problem, delivered to `error` listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum StreamFault {
    /// One frame could not be decoded. The connection stays up.
    Decode { event_name: String, message: String },
    /// Reconnect budget exhausted. Raised once per exhaustion.
    ConnectionLost { attempts: u32, message: String },
}

impl std::fmt::Display for StreamFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamFault::Decode {
                event_name,
                message,
            } => write!(f, "could not decode '{}' event: {}", event_name, message),
            StreamFault::ConnectionLost { attempts, message } => write!(
                f,
                "live updates unavailable after {} reconnect attempts: {}",
                attempts, message
            ),
        }
    }
}

/// What listeners receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", content = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Inbound(InboundEvent),
    Error(StreamFault),
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Inbound(event) => event.kind(),
            ClientEvent::Error(_) => EventKind::Error,
        }
    }
}

pub type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&ClientEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Listeners keyed by event kind, kept in registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    by_kind: HashMap<EventKind, Vec<Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: EventKind, listener: Listener) {
        self.by_kind.entry(kind).or_default().push(listener);
    }

    /// Removes the first registration of exactly this listener under `kind`.
    pub fn remove(&mut self, kind: EventKind, listener: &Listener) -> bool {
        let Some(listeners) = self.by_kind.get_mut(&kind) else {
            return false;
        };
        let Some(idx) = listeners.iter().position(|l| same_listener(l, listener)) else {
            return false;
        };
        listeners.remove(idx);
        if listeners.is_empty() {
            self.by_kind.remove(&kind);
        }
        true
    }

    pub fn snapshot(&self, kind: EventKind) -> Vec<Listener> {
        self.by_kind.get(&kind).cloned().unwrap_or_default()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.by_kind.get(&kind).map(Vec::len).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }
}

// Data-pointer identity; vtable pointers for one closure type can differ
// across codegen units.
fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Calls every listener in order. A panicking listener is logged and
/// skipped; the rest still run. Returns how many panicked.
pub fn dispatch(listeners: &[Listener], event: &ClientEvent) -> usize {
    let mut failures = 0;
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
            failures += 1;
            tracing::error!("Listener for '{}' panicked; continuing", event.kind());
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crabgrass_types::Connected;
    use std::sync::Mutex;

    fn connected() -> ClientEvent {
        ClientEvent::Inbound(InboundEvent::Connected(Connected::default()))
    }

    #[test]
    fn panicking_listener_does_not_block_later_ones() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = listener(|_| panic!("listener bug"));
        let seen_clone = seen.clone();
        let second = listener(move |event| seen_clone.lock().unwrap().push(event.kind()));

        let failures = dispatch(&[first, second], &connected());

        assert_eq!(failures, 1);
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::Connected]);
    }

    #[test]
    fn remove_drops_only_first_matching_registration() {
        let mut registry = ListenerRegistry::new();
        let a = listener(|_| {});
        let b = listener(|_| {});
        registry.add(EventKind::FileSaved, a.clone());
        registry.add(EventKind::FileSaved, b.clone());
        registry.add(EventKind::FileSaved, a.clone());

        assert!(registry.remove(EventKind::FileSaved, &a));
        let left = registry.snapshot(EventKind::FileSaved);
        assert_eq!(left.len(), 2);
        assert!(same_listener(&left[0], &b));
        assert!(same_listener(&left[1], &a));

        assert!(!registry.remove(EventKind::AgentEdit, &a));
    }

    #[test]
    fn removing_last_listener_forgets_kind() {
        let mut registry = ListenerRegistry::new();
        let a = listener(|_| {});
        registry.add(EventKind::Error, a.clone());
        assert!(registry.remove(EventKind::Error, &a));
        assert_eq!(registry.total(), 0);
        assert!(!registry.remove(EventKind::Error, &a));
    }

    #[test]
    fn error_events_are_keyed_as_error() {
        let fault = ClientEvent::Error(StreamFault::ConnectionLost {
            attempts: 5,
            message: "refused".to_string(),
        });
        assert_eq!(fault.kind(), EventKind::Error);
    }
}
