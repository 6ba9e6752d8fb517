//! Pub/sub plumbing shared by the job registry.
//!
//! Two shapes are provided:
//! - [`ListenerSet`]: synchronous callbacks registered against one resource
//!   (one job), each with a [`Subscription`] disposer.
//! - [`JobEventBroadcaster`]: a tokio broadcast channel carrying every job's
//!   transitions, for observers that aren't tied to a single job.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::jobs::JobStatus;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Dispose = Box<dyn FnOnce() + Send>;

/// Disposer returned by a subscription.
///
/// Unsubscribes when [`unsubscribe`](Self::unsubscribe) is called or when the
/// value is dropped. Both are idempotent and safe after the underlying
/// resource is gone.
#[must_use = "dropping a Subscription unsubscribes the listener; call `detach` to keep it"]
pub struct Subscription {
    dispose: Mutex<Option<Dispose>>,
}

impl Subscription {
    fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Mutex::new(Some(Box::new(dispose))),
        }
    }

    /// A subscription with nothing to dispose.
    pub fn empty() -> Self {
        Self {
            dispose: Mutex::new(None),
        }
    }

    pub fn unsubscribe(&self) {
        // Take first so the lock isn't held while disposing.
        let dispose = self.dispose.lock().take();
        if let Some(dispose) = dispose {
            dispose();
        }
    }

    /// Keep the listener registered for as long as its resource lives.
    pub fn detach(self) {
        self.dispose.lock().take();
    }

    pub fn is_active(&self) -> bool {
        self.dispose.lock().is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Ordered set of synchronous listeners.
pub struct ListenerSet<T> {
    listeners: Arc<Mutex<Vec<(u64, Listener<T>)>>>,
    next_token: AtomicU64,
}

impl<T: 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register a listener. It receives every value emitted after this call.
    pub fn add<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((token, Arc::new(listener)));

        let weak = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                listeners.lock().retain(|(t, _)| *t != token);
            }
        })
    }

    /// Invoke every listener in registration order.
    ///
    /// The list is snapshotted first, so listeners may subscribe, unsubscribe
    /// or call back into the owner without deadlocking.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener(value);
        }
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}

impl<T: 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A status or progress change on some job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub at: DateTime<Utc>,
}

/// Broadcaster for job events across all jobs.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: broadcast::Sender<JobEvent>,
}

impl JobEventBroadcaster {
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of receivers reached (0 if none).
    pub fn publish(&self, event: JobEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::with_capacity(crate::config::DEFAULT_EVENT_CAPACITY)
    }
}
