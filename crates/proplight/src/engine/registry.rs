use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;

use super::message::DeviceChange;
use super::message::DeviceCommand;
use super::message::DispatchError;
use super::state::DeviceSnapshot;

/// Channel types for device change events delivered to a group controller.
/// Bounded so a slow controller cannot make the bus buffer without limit.
pub type DeviceChangeSender = mpsc::Sender<DeviceChange>;
pub type DeviceChangeReceiver = mpsc::Receiver<DeviceChange>;

/// Source of member device state, and sink for device commands.
///
/// Implementations must tolerate concurrent `send_command` calls; a group
/// controller fans commands out to all members at once.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Current state of a device, or `None` if it is unknown or unavailable.
    fn get_snapshot(&self, device_id: &str) -> Option<DeviceSnapshot>;

    /// Deliver a command to a device.
    async fn send_command(
        &self,
        device_id: &str,
        command: DeviceCommand,
    ) -> Result<(), DispatchError>;
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Notifies subscribers when a tracked device's state changes.
pub trait EventBus: Send + Sync {
    /// Deliver changes of any of `device_ids` into `tx`.
    fn subscribe(&self, device_ids: &[String], tx: DeviceChangeSender) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}

struct Subscriber {
    device_ids: HashSet<String>,
    tx: DeviceChangeSender,
}

/// In-process event bus.
///
/// Publishing never blocks: a subscriber whose queue is full misses the event.
#[derive(Default)]
pub struct LocalEventBus {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a change to every subscriber tracking the device.
    pub fn publish(&self, change: DeviceChange) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };

        subscribers.retain(|id, subscriber| {
            if !subscriber.device_ids.contains(&change.device_id) {
                return true;
            }
            match subscriber.tx.try_send(change.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(
                        "Subscriber {:?} queue full, dropping change for {}",
                        id, change.device_id
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Subscriber {:?} went away, removing", id);
                    false
                }
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl EventBus for LocalEventBus {
    fn subscribe(&self, device_ids: &[String], tx: DeviceChangeSender) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Subscriber {
            device_ids: device_ids.iter().cloned().collect(),
            tx,
        };
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(id, subscriber);
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&id);
        }
    }
}
