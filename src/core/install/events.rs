use super::{
    session::SessionId,
    state::{InstallationProgress, InstallationResult},
};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    mpsc::{self, Receiver, Sender},
    Mutex, PoisonError,
};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstallationEvent {
    Progress(InstallationProgress),
    /// Published once per attempt, after its terminal progress update.
    Finished(InstallationResult),
    UserActionRequired {
        package_id: String,
        session_id: SessionId,
    },
}

impl InstallationEvent {
    pub fn package_id(&self) -> &str {
        match self {
            InstallationEvent::Progress(progress) => &progress.package_id,
            InstallationEvent::Finished(result) => &result.package_id,
            InstallationEvent::UserActionRequired { package_id, .. } => package_id,
        }
    }
}

pub type SubscriberId = u64;

pub struct Subscription {
    pub id: SubscriberId,
    pub events: Receiver<InstallationEvent>,
}

/// Fan-out of installation events to any number of observers.
///
/// Each subscriber gets its own channel, so a slow observer never blocks the installer. Dropped
/// receivers are pruned on the next publish.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriberId, Sender<InstallationEvent>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, tx));
        Subscription { id, events: rx }
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(subscriber, _)| *subscriber != id);
        subscribers.len() != before
    }

    pub fn publish(&self, event: InstallationEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
