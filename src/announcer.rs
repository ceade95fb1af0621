use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::events::RunEvent;

/// Fan-out of one campaign's run events to any number of listeners.
///
/// Each subscriber gets its own bounded queue. Publishing never waits: a
/// subscriber that falls behind by more than the capacity loses the oldest
/// events, and events published before `subscribe` are never seen.
#[derive(Clone)]
pub struct Announcer {
    tx: broadcast::Sender<RunEvent>,
}

impl Announcer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers the event reached.
    pub fn publish(&self, event: RunEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                debug!(
                    campaign = event.campaign_id(),
                    kind = event.event_type(),
                    "no listeners for event"
                );
                0
            }
        }
    }

    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[derive(Default)]
pub struct AnnouncerRegistry {
    announcers: HashMap<String, Announcer>,
}

impl AnnouncerRegistry {
    /// The campaign's announcer, created on first use.
    pub fn get_or_create(&mut self, campaign_id: &str, capacity: usize) -> Announcer {
        self.announcers
            .entry(campaign_id.to_string())
            .or_insert_with(|| Announcer::new(capacity))
            .clone()
    }

    pub fn get(&self, campaign_id: &str) -> Option<Announcer> {
        self.announcers.get(campaign_id).cloned()
    }

    pub fn remove(&mut self, campaign_id: &str) -> Option<Announcer> {
        self.announcers.remove(campaign_id)
    }
}
