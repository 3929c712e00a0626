//! Ordered, synchronous event fan-out.
//!
//! Listeners run on the firing thread in connection order. The listener list
//! is snapshotted before delivery, so a listener may connect, disconnect or
//! fire other signals without deadlocking.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalInner<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
}

trait ListenerSlot: Send + Sync {
    fn remove(&self, id: u64);
}

impl<T: 'static> ListenerSlot for SignalInner<T> {
    fn remove(&self, id: u64) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        listeners.retain(|(listener_id, _)| *listener_id != id);
    }
}

pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn connect<F>(&self, listener: F) -> Connection
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, Arc::new(listener)));

        let slot: Arc<dyn ListenerSlot> = self.inner.clone();
        Connection {
            id,
            slot: Arc::downgrade(&slot),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn fire(&self, payload: &T) {
        let listeners: Vec<Listener<T>> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(payload);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn disconnect_all(&self) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}

/// Handle returned by [`Signal::connect`]. Dropping it keeps the listener
/// connected; call [`Connection::disconnect`] or hand it to a
/// [`Scope`](crate::tracker::Scope).
#[derive(Clone)]
pub struct Connection {
    id: u64,
    slot: Weak<dyn ListenerSlot>,
    connected: Arc<AtomicBool>,
}

impl Connection {
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Some(slot) = self.slot.upgrade() {
                slot.remove(self.id);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.slot.strong_count() > 0
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_in_connection_order() {
        let signal: Signal<u32> = Signal::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            signal.connect(move |value: &u32| seen.lock().unwrap().push(format!("{tag}:{value}")));
        }

        signal.fire(&7);
        assert_eq!(*seen.lock().unwrap(), vec!["first:7", "second:7"]);
    }

    #[test]
    fn test_disconnect_stops_delivery() {
        let signal: Signal<()> = Signal::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let connection = signal.connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        signal.fire(&());
        connection.disconnect();
        connection.disconnect();
        signal.fire(&());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!connection.is_connected());
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_fire_reentrantly() {
        let outer: Signal<u8> = Signal::new();
        let inner: Signal<u8> = Signal::new();
        let hits = Arc::new(AtomicU64::new(0));

        let relay = inner.clone();
        outer.connect(move |value| relay.fire(value));
        let counter = Arc::clone(&hits);
        inner.connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        outer.fire(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
