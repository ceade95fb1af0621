use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started { campaign_id: String, run_id: String, total: usize, done: usize },
    Progress {
        campaign_id: String,
        /// Row of the campaign db that was just processed.
        position: usize,
        dataset: String,
        split: String,
        example_idx: usize,
        setup_id: Option<String>,
        done: usize,
        total: usize,
        payload: serde_json::Value,
    },
    ExampleFailed { campaign_id: String, position: usize, error: String },
    Paused { campaign_id: String, done: usize, total: usize },
    Finished { campaign_id: String, done: usize, total: usize },
    Failed { campaign_id: String, error: String },
}

impl RunEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            RunEvent::Started { .. } => "started",
            RunEvent::Progress { .. } => "progress",
            RunEvent::ExampleFailed { .. } => "example_failed",
            RunEvent::Paused { .. } => "paused",
            RunEvent::Finished { .. } => "finished",
            RunEvent::Failed { .. } => "failed",
        }
    }

    pub fn campaign_id(&self) -> &str {
        match self {
            RunEvent::Started { campaign_id, .. }
            | RunEvent::Progress { campaign_id, .. }
            | RunEvent::ExampleFailed { campaign_id, .. }
            | RunEvent::Paused { campaign_id, .. }
            | RunEvent::Finished { campaign_id, .. }
            | RunEvent::Failed { campaign_id, .. } => campaign_id,
        }
    }

    /// Whether the run emits nothing after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::Paused { .. } | RunEvent::Finished { .. } | RunEvent::Failed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_with_snake_case_type() {
        let evt = RunEvent::Paused { campaign_id: "c".into(), done: 1, total: 3 };
        let v = serde_json::to_value(&evt).unwrap();
        assert_eq!(v["type"], "paused");
        assert_eq!(evt.event_type(), "paused");
        assert!(evt.is_terminal());
    }
}
