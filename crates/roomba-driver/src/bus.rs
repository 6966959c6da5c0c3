//! Subscriber registry for change notifications.
//!
//! Each subscriber gets its own bounded [`mpsc`] channel, registered under a
//! [`SubscriberId`] together with the [`SensorCategory`] values it wants.
//! Publishing never waits: a subscriber whose channel is full misses that
//! notification, and one whose receiver was dropped is removed.
//!
//! ```ignore
//! let mut sub = driver.subscribe([SensorCategory::Pose]);
//! while let Some(n) = sub.recv().await {
//!     println!("{:?}", n.payload);
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::stream::{self, BoxStream};
use roomba_types::{Notification, SensorCategory};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Notifications buffered per subscriber before new ones are dropped.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Subscriber {
    categories: HashSet<SensorCategory>,
    tx: mpsc::Sender<Notification>,
}

/// Shared registry.  Clones refer to the same subscribers.
#[derive(Clone)]
pub struct NotificationBus {
    subscribers: Arc<Mutex<HashMap<SubscriberId, Subscriber>>>,
    capacity: usize,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a subscriber.  An empty category list subscribes to all.
    pub fn subscribe(&self, categories: impl IntoIterator<Item = SensorCategory>) -> Subscription {
        let mut categories: HashSet<_> = categories.into_iter().collect();
        if categories.is_empty() {
            categories.extend(SensorCategory::ALL);
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = SubscriberId(Uuid::new_v4());
        debug!(subscriber = %id, ?categories, "subscriber added");
        self.lock().insert(id, Subscriber { categories, tx });
        Subscription { id, rx }
    }

    /// Returns `false` when `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Fan `notification` out to every interested subscriber.
    ///
    /// Returns the number of subscribers it was delivered to.
    pub fn publish(&self, notification: &Notification) -> usize {
        let category = notification.category();
        let mut delivered = 0;
        self.lock().retain(|id, sub| {
            if !sub.categories.contains(&category) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(notification.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %id, ?category, "subscriber lagging, notification dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = %id, "subscriber went away");
                    false
                }
            }
        });
        delivered
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Receiving half handed to a subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Notification>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next notification; `None` once the driver has shut down.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Consume the subscription as a stream of notifications.
    pub fn into_stream(self) -> BoxStream<'static, Notification> {
        Box::pin(stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|n| (n, rx))
        }))
    }
}
