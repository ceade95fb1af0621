use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FMT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignMode {
    Crowdsourcing,
    LlmEval,
    LlmGen,
    External,
    Hidden,
}

impl CampaignMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignMode::Crowdsourcing => "crowdsourcing",
            CampaignMode::LlmEval => "llm_eval",
            CampaignMode::LlmGen => "llm_gen",
            CampaignMode::External => "external",
            CampaignMode::Hidden => "hidden",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "crowdsourcing" => Some(CampaignMode::Crowdsourcing),
            "llm_eval" => Some(CampaignMode::LlmEval),
            "llm_gen" => Some(CampaignMode::LlmGen),
            "external" => Some(CampaignMode::External),
            "hidden" => Some(CampaignMode::Hidden),
            _ => None,
        }
    }

    /// Modes driven by the background runner.
    pub fn is_llm(&self) -> bool {
        matches!(self, CampaignMode::LlmEval | CampaignMode::LlmGen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Idle,
    Running,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExampleStatus {
    #[default]
    Free,
    Assigned,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignMetadata {
    pub id: String,
    pub mode: CampaignMode,
    pub status: CampaignStatus,
    #[serde(default)]
    pub config: serde_json::Value,
    pub created: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl CampaignMetadata {
    pub fn new(id: &str, mode: CampaignMode, config: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            mode,
            status: CampaignStatus::Idle,
            config,
            created: now_timestamp(),
            last_run: None,
            last_error: None,
        }
    }
}

/// One row of a campaign's `db.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleRecord {
    pub dataset: String,
    pub split: String,
    pub example_idx: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_id: Option<String>,
    #[serde(default)]
    pub status: ExampleStatus,
    #[serde(default)]
    pub batch_idx: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotator_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
}

impl ExampleRecord {
    pub fn new(dataset: &str, split: &str, example_idx: usize, setup_id: Option<&str>) -> Self {
        Self {
            dataset: dataset.to_string(),
            split: split.to_string(),
            example_idx,
            setup_id: setup_id.map(str::to_string),
            status: ExampleStatus::Free,
            batch_idx: 0,
            annotator_id: None,
            start: None,
        }
    }

    pub fn reset(&mut self) {
        self.status = ExampleStatus::Free;
        self.annotator_id = None;
        self.start = None;
    }

    pub fn matches(
        &self,
        dataset: &str,
        split: &str,
        example_idx: usize,
        setup_id: Option<&str>,
    ) -> bool {
        self.dataset == dataset
            && self.split == split
            && self.example_idx == example_idx
            && self.setup_id.as_deref() == setup_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CampaignStats {
    pub total: usize,
    pub free: usize,
    pub assigned: usize,
    pub finished: usize,
}

/// State shared by every campaign variant.
#[derive(Debug, Clone)]
pub struct CampaignData {
    pub dir: PathBuf,
    pub metadata: CampaignMetadata,
    pub examples: Vec<ExampleRecord>,
}

impl CampaignData {
    pub fn files_dir(&self) -> PathBuf {
        self.dir.join("files")
    }

    pub fn stats(&self) -> CampaignStats {
        let mut stats = CampaignStats { total: self.examples.len(), ..Default::default() };
        for ex in &self.examples {
            match ex.status {
                ExampleStatus::Free => stats.free += 1,
                ExampleStatus::Assigned => stats.assigned += 1,
                ExampleStatus::Finished => stats.finished += 1,
            }
        }
        stats
    }

    pub fn pending_positions(&self) -> Vec<usize> {
        self.examples
            .iter()
            .enumerate()
            .filter(|(_, ex)| ex.status != ExampleStatus::Finished)
            .map(|(i, _)| i)
            .collect()
    }
}

/// A campaign, one variant per mode.
#[derive(Debug, Clone)]
pub enum Campaign {
    Crowdsourcing(CampaignData),
    LlmEval(CampaignData),
    LlmGen(CampaignData),
    External(CampaignData),
    Hidden(CampaignData),
}

impl Campaign {
    pub fn from_parts(
        dir: &Path,
        metadata: CampaignMetadata,
        examples: Vec<ExampleRecord>,
    ) -> Self {
        let data = CampaignData { dir: dir.to_path_buf(), metadata, examples };
        match data.metadata.mode {
            CampaignMode::Crowdsourcing => Campaign::Crowdsourcing(data),
            CampaignMode::LlmEval => Campaign::LlmEval(data),
            CampaignMode::LlmGen => Campaign::LlmGen(data),
            CampaignMode::External => Campaign::External(data),
            CampaignMode::Hidden => Campaign::Hidden(data),
        }
    }

    pub fn data(&self) -> &CampaignData {
        match self {
            Campaign::Crowdsourcing(d)
            | Campaign::LlmEval(d)
            | Campaign::LlmGen(d)
            | Campaign::External(d)
            | Campaign::Hidden(d) => d,
        }
    }

    pub fn data_mut(&mut self) -> &mut CampaignData {
        match self {
            Campaign::Crowdsourcing(d)
            | Campaign::LlmEval(d)
            | Campaign::LlmGen(d)
            | Campaign::External(d)
            | Campaign::Hidden(d) => d,
        }
    }

    pub fn id(&self) -> &str {
        &self.data().metadata.id
    }

    pub fn mode(&self) -> CampaignMode {
        self.data().metadata.mode
    }

    pub fn metadata(&self) -> &CampaignMetadata {
        &self.data().metadata
    }

    pub fn status(&self) -> CampaignStatus {
        self.data().metadata.status
    }

    /// Whether records in `files/` are annotations that belong in the annotation index.
    pub fn has_annotations(&self) -> bool {
        match self {
            Campaign::Crowdsourcing(_) | Campaign::LlmEval(_) | Campaign::External(_) => true,
            Campaign::LlmGen(_) | Campaign::Hidden(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_serde_names() {
        let json = serde_json::to_string(&CampaignMode::LlmEval).unwrap();
        assert_eq!(json, "\"llm_eval\"");
        assert_eq!(CampaignMode::parse("llm_gen"), Some(CampaignMode::LlmGen));
        assert_eq!(CampaignMode::parse("nope"), None);
    }

    #[test]
    fn metadata_tolerates_missing_optional_fields() {
        let raw = r#"{"id":"c1","mode":"llm_gen","status":"running","config":{},
            "created":"2024-01-01 00:00:00"}"#;
        let meta: CampaignMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.status, CampaignStatus::Running);
        assert!(meta.last_run.is_none());
    }

    #[test]
    fn stats_count_each_status() {
        let mut examples = vec![
            ExampleRecord::new("d", "dev", 0, None),
            ExampleRecord::new("d", "dev", 1, None),
            ExampleRecord::new("d", "dev", 2, None),
        ];
        examples[0].status = ExampleStatus::Finished;
        examples[1].status = ExampleStatus::Assigned;
        let meta = CampaignMetadata::new("c", CampaignMode::LlmGen, serde_json::json!({}));
        let c = Campaign::from_parts(Path::new("/tmp/c"), meta, examples);

        let stats = c.data().stats();
        assert_eq!(stats, CampaignStats { total: 3, free: 1, assigned: 1, finished: 1 });
        assert_eq!(c.data().pending_positions(), vec![1, 2]);
        assert!(matches!(c, Campaign::LlmGen(_)));
        assert!(!c.has_annotations());
    }
}
