// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Client Contributors

// VPN Client - Event Bus Module
// Fans profile events out to every registered listener mailbox

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use vpn_client_common::{Event, EventKind};

/// Default mailbox capacity per listener
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Identity of a listener inside the bus
pub type ListenerId = u64;

/// Registry of listener mailboxes
///
/// Cloning is cheap and every clone refers to the same registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    listeners: RwLock<HashMap<ListenerId, mpsc::Sender<Event>>>,
    next_id: AtomicU64,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Create a listener and add its mailbox to the registry
    pub fn register(&self) -> Listener {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);

        self.write_listeners().insert(id, tx);
        debug!("Registered event listener {}", id);

        Listener {
            id,
            bus: self.clone(),
            rx,
            closed: false,
        }
    }

    /// Remove a listener's mailbox from the registry
    ///
    /// Returns false if the listener was already gone.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let removed = self.write_listeners().remove(&id).is_some();
        if removed {
            debug!("Unregistered event listener {}", id);
        }
        removed
    }

    /// Publish an event to every registered listener.
    ///
    /// The identifier is assigned here. Delivery never blocks: a full or
    /// closed mailbox loses this event and nothing else.
    pub fn publish(&self, kind: EventKind) -> Event {
        let event = Event::new(kind);
        let listeners = self.read_listeners();

        for (id, tx) in listeners.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Listener {} mailbox full, dropping {} event {}",
                        id,
                        event.kind.type_name(),
                        event.id
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("Listener {} mailbox closed, dropping event {}", id, event.id);
                }
            }
        }

        event
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.read_listeners().len()
    }

    /// Deliveries lost to full or closed mailboxes since startup
    pub fn dropped_deliveries(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    // A panic while holding the lock leaves the map intact, so poisoning is ignored
    fn read_listeners(&self) -> RwLockReadGuard<'_, HashMap<ListenerId, mpsc::Sender<Event>>> {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_listeners(&self) -> RwLockWriteGuard<'_, HashMap<ListenerId, mpsc::Sender<Event>>> {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY)
    }
}

/// One subscriber's mailbox
///
/// Dropping the listener closes it.
pub struct Listener {
    id: ListenerId,
    bus: EventBus,
    rx: mpsc::Receiver<Event>,
    closed: bool,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Wait for the next event; `None` once the listener is closed and drained
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting
    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Unregister from the bus, then close the mailbox.
    ///
    /// Events delivered before the close can still be drained with `recv`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.bus.unregister(self.id);
        self.rx.close();
        self.closed = true;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}
