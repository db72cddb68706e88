use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use shared::protocol::{OutputEvent, StatusEvent};
use tracing::{debug, error, warn};

/// Receiver side of the bus. Both callbacks default to no-ops.
pub trait BusListener: Send + Sync {
    fn on_status(&self, event: &StatusEvent) {
        let _ = event;
    }

    fn on_output(&self, event: &OutputEvent) {
        let _ = event;
    }
}

struct SubscriberSlot {
    id: u64,
    listener: Arc<dyn BusListener>,
    disposed: AtomicBool,
}

#[derive(Default)]
struct BusInner {
    next_subscription_id: AtomicU64,
    subscribers: RwLock<Vec<Arc<SubscriberSlot>>>,
    disposed: AtomicBool,
}

impl BusInner {
    fn snapshot(&self) -> Vec<Arc<SubscriberSlot>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|slot| slot.id != id);
    }
}

/// Fan-out point for status and output events.
///
/// The bus does no filtering. Every subscriber registered before a publish call receives
/// that event exactly once, synchronously; later subscribers never see it. Delivery walks a
/// snapshot of the subscriber list, so callbacks may unsubscribe themselves or others.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn BusListener>) -> Subscription {
        let id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        let slot = Arc::new(SubscriberSlot {
            id,
            listener,
            disposed: AtomicBool::new(false),
        });

        if self.inner.disposed.load(Ordering::Acquire) {
            warn!(subscription = id, "subscribe on a disposed event bus; subscription is inert");
            slot.disposed.store(true, Ordering::Release);
        } else {
            self.inner
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::clone(&slot));
        }

        Subscription {
            slot,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Same as [`Subscription::dispose`]; safe to call any number of times.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        subscription.dispose()
    }

    /// Returns the number of subscribers the event was delivered to.
    pub fn publish_status(&self, event: &StatusEvent) -> usize {
        self.fan_out("status", |listener| listener.on_status(event))
    }

    pub fn publish_output(&self, event: &OutputEvent) -> usize {
        self.fan_out("output", |listener| listener.on_output(event))
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops every subscriber. Later publishes reach nobody and later subscriptions are inert.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained = std::mem::take(
            &mut *self
                .inner
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for slot in &drained {
            slot.disposed.store(true, Ordering::Release);
        }
        debug!(subscribers = drained.len(), "event bus disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn fan_out(&self, channel: &'static str, deliver: impl Fn(&dyn BusListener)) -> usize {
        let mut delivered = 0;
        for slot in self.inner.snapshot() {
            // Disposal may have happened after the snapshot was taken.
            if slot.disposed.load(Ordering::Acquire) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| deliver(slot.listener.as_ref()))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(
                    subscription = slot.id,
                    channel, "bus subscriber panicked; continuing delivery"
                ),
            }
        }
        delivered
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Registration handle returned by [`EventBus::subscribe`].
///
/// Once disposed, no callback of the listener fires again. Dropping the handle disposes it.
pub struct Subscription {
    slot: Arc<SubscriberSlot>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    pub fn is_disposed(&self) -> bool {
        self.slot.disposed.load(Ordering::Acquire)
    }

    /// Returns `true` only for the call that actually disposed the subscription.
    pub fn dispose(&self) -> bool {
        if self.slot.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.slot.id);
        }
        true
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.slot.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/bus_tests.rs"]
mod tests;
