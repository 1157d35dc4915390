//! Notification fan-out
//!
//! Delivers download events to attached listeners in registration order and
//! to broadcast subscribers. A panicking listener is logged and skipped.

use fetchq_types::DownloadEvent;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Observer of download events.
///
/// Called synchronously while the engine holds its namespace lock, so an
/// implementation must return quickly and must not wait on engine operations.
pub trait DownloadListener: Send + Sync {
    fn on_event(&self, event: &DownloadEvent);
}

impl<F> DownloadListener for F
where
    F: Fn(&DownloadEvent) + Send + Sync,
{
    fn on_event(&self, event: &DownloadEvent) {
        self(event)
    }
}

struct Registration {
    owner: u64,
    listener: Arc<dyn DownloadListener>,
}

pub(crate) struct Fanout {
    listeners: Mutex<Vec<Registration>>,
    events: broadcast::Sender<DownloadEvent>,
}

fn same_listener(a: &Arc<dyn DownloadListener>, b: &Arc<dyn DownloadListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl Fanout {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Register `listener` for `owner`. Returns false if it is already attached.
    pub fn attach(&self, owner: u64, listener: Arc<dyn DownloadListener>) -> bool {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|r| same_listener(&r.listener, &listener)) {
            return false;
        }
        listeners.push(Registration { owner, listener });
        true
    }

    pub fn detach(&self, listener: &Arc<dyn DownloadListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|r| !same_listener(&r.listener, listener));
        listeners.len() != before
    }

    /// Drop every listener registered by `owner`
    pub fn detach_owner(&self, owner: u64) {
        self.listeners.lock().retain(|r| r.owner != owner);
    }

    pub fn count(&self, owner: u64) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|r| r.owner == owner)
            .count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Deliver `event` to every listener, then to broadcast subscribers
    pub fn dispatch(&self, event: DownloadEvent) {
        let listeners: Vec<Arc<dyn DownloadListener>> = self
            .listeners
            .lock()
            .iter()
            .map(|r| Arc::clone(&r.listener))
            .collect();

        for listener in &listeners {
            deliver(listener.as_ref(), &event);
        }

        let _ = self.events.send(event);
    }

    /// Deliver `events` to a single listener only
    pub fn replay(&self, listener: &dyn DownloadListener, events: impl IntoIterator<Item = DownloadEvent>) {
        for event in events {
            deliver(listener, &event);
        }
    }
}

fn deliver(listener: &dyn DownloadListener, event: &DownloadEvent) {
    if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
        warn!(
            "Listener panicked while handling {:?} for download {}",
            event.kind, event.download.id
        );
    }
}
