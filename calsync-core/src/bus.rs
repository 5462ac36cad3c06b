//! Observer channel used for auth and sync-status notifications.
//!
//! `subscribe` returns a handle; dropping it (or calling `unsubscribe`)
//! removes the listener. Dispatch iterates a snapshot of the listener set,
//! so a listener that removes itself while being notified is safe.

use parking_lot::Mutex;
use std::sync::Arc;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct BusInner<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

pub struct Bus<T> {
    inner: Arc<Mutex<BusInner<T>>>,
}

impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Bus {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Bus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Bus<T> {
    pub fn new() -> Self {
        Bus {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        Subscription {
            id,
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = {
            let inner = self.inner.lock();
            inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in snapshot {
            listener(value);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

/// Handle returned by [`Bus::subscribe`]; removes the listener on drop.
pub struct Subscription<T> {
    id: u64,
    inner: Arc<Mutex<BusInner<T>>>,
}

impl<T> Subscription<T> {
    pub fn unsubscribe(self) {
        // Removal happens in Drop.
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.listeners.retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let bus: Bus<u32> = Bus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen2 = Arc::clone(&seen);
        let sub = bus.subscribe(move |v| {
            seen2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        bus.emit(&3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        sub.unsubscribe();
        bus.emit(&5);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_listener_removing_itself_during_dispatch() {
        let bus: Bus<()> = Bus::new();
        let slot: Arc<Mutex<Option<Subscription<()>>>> = Arc::new(Mutex::new(None));

        let slot2 = Arc::clone(&slot);
        let sub = bus.subscribe(move |_| {
            // Dropping our own subscription mid-dispatch must not deadlock.
            slot2.lock().take();
        });
        *slot.lock() = Some(sub);

        bus.emit(&());
        assert_eq!(bus.listener_count(), 0);
    }
}
