//! Single-flight registry for repairs.
//!
//! At most one repair per `(workflow, step)` pair runs at a time. The
//! first caller becomes the leader; later callers follow and receive the
//! leader's outcome when it completes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use tokio::sync::watch;

type Key = (String, String);
type Slots<T> = Arc<Mutex<HashMap<Key, watch::Receiver<Option<T>>>>>;

/// Tracks repairs in progress, keyed by workflow name and step id.
pub struct InflightRegistry<T> {
    slots: Slots<T>,
}

impl<T> Clone for InflightRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T> Default for InflightRegistry<T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Outcome of [`InflightRegistry::claim`].
pub enum Claim<T> {
    Leader(LeaderGuard<T>),
    Follower(Follower<T>),
}

fn lock<T>(slots: &Slots<T>) -> MutexGuard<'_, HashMap<Key, watch::Receiver<Option<T>>>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone> InflightRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in repairing `step_id` of `workflow`.
    pub fn claim(&self, workflow: &str, step_id: &str) -> Claim<T> {
        let key = (workflow.to_string(), step_id.to_string());
        let mut slots = lock(&self.slots);

        if let Some(receiver) = slots.get(&key) {
            debug!("Repair of '{}' in '{}' already in flight", step_id, workflow);
            return Claim::Follower(Follower {
                receiver: receiver.clone(),
            });
        }

        let (sender, receiver) = watch::channel(None);
        slots.insert(key.clone(), receiver);
        Claim::Leader(LeaderGuard {
            key,
            sender,
            slots: Arc::clone(&self.slots),
        })
    }

    /// Whether a repair of `step_id` in `workflow` is in progress.
    pub fn is_inflight(&self, workflow: &str, step_id: &str) -> bool {
        lock(&self.slots).contains_key(&(workflow.to_string(), step_id.to_string()))
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held by the caller performing the repair. Dropping it, completed or
/// not, frees the slot.
pub struct LeaderGuard<T> {
    key: Key,
    sender: watch::Sender<Option<T>>,
    slots: Slots<T>,
}

impl<T> LeaderGuard<T> {
    /// Publishes the outcome to every follower and frees the slot.
    pub fn complete(self, outcome: T) {
        self.sender.send_replace(Some(outcome));
    }
}

impl<T> Drop for LeaderGuard<T> {
    fn drop(&mut self) {
        lock(&self.slots).remove(&self.key);
    }
}

/// Waits for a leader's outcome.
pub struct Follower<T> {
    receiver: watch::Receiver<Option<T>>,
}

impl<T: Clone> Follower<T> {
    /// Returns the leader's outcome, or `None` if the leader went away
    /// without completing (cancelled or panicked).
    pub async fn wait(mut self) -> Option<T> {
        loop {
            if let Some(outcome) = self.receiver.borrow_and_update().clone() {
                return Some(outcome);
            }
            if self.receiver.changed().await.is_err() {
                return self.receiver.borrow().clone();
            }
        }
    }
}
