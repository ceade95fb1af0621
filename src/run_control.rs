use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CampaignError, Result};

/// Live state of one active run.
#[derive(Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub token: CancellationToken,
}

/// Campaign id -> live run. Lives behind the application's coarse lock.
#[derive(Default)]
pub struct RunControlTable {
    runs: HashMap<String, RunHandle>,
}

impl RunControlTable {
    /// Claim the campaign for a new run. Fails if a run is already registered.
    pub fn register(&mut self, campaign_id: &str) -> Result<RunHandle> {
        if self.runs.contains_key(campaign_id) {
            return Err(CampaignError::AlreadyRunning(campaign_id.to_string()));
        }
        let handle = RunHandle {
            run_id: Uuid::new_v4().to_string(),
            token: CancellationToken::new(),
        };
        self.runs.insert(campaign_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Ask the run to stop at its next example boundary. `false` when nothing is running.
    pub fn request_pause(&self, campaign_id: &str) -> bool {
        match self.runs.get(campaign_id) {
            Some(handle) => {
                handle.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, campaign_id: &str) -> bool {
        self.runs.get(campaign_id).is_some_and(|h| !h.token.is_cancelled())
    }

    /// Whether any run state exists, paused-but-not-yet-exited included.
    pub fn is_live(&self, campaign_id: &str) -> bool {
        self.runs.contains_key(campaign_id)
    }

    /// Drop the entry, but only if it still belongs to `run_id`.
    pub fn release(&mut self, campaign_id: &str, run_id: &str) {
        if self.runs.get(campaign_id).is_some_and(|h| h.run_id == run_id) {
            self.runs.remove(campaign_id);
        }
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.runs.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_register_is_rejected() {
        let mut table = RunControlTable::default();
        table.register("c").unwrap();
        assert!(matches!(table.register("c"), Err(CampaignError::AlreadyRunning(_))));
    }

    #[test]
    fn pause_flips_running_flag() {
        let mut table = RunControlTable::default();
        let handle = table.register("c").unwrap();
        assert!(table.is_running("c"));

        assert!(table.request_pause("c"));
        assert!(handle.token.is_cancelled());
        assert!(!table.is_running("c"));
        assert!(table.is_live("c"));
    }

    #[test]
    fn pause_without_run_is_noop() {
        let table = RunControlTable::default();
        assert!(!table.request_pause("ghost"));
        assert!(!table.is_running("ghost"));
    }

    #[test]
    fn release_ignores_stale_run_ids() {
        let mut table = RunControlTable::default();
        let first = table.register("c").unwrap();
        table.release("c", &first.run_id);
        let second = table.register("c").unwrap();
        table.release("c", &first.run_id);
        assert!(table.is_live("c"));
        table.release("c", &second.run_id);
        assert!(!table.is_live("c"));
    }
}
