//! On-disk campaign layout:
//!
//! ```text
//! <campaigns_dir>/<id>/metadata.json
//! <campaigns_dir>/<id>/db.jsonl
//! <campaigns_dir>/<id>/files/*.jsonl
//! ```

use std::path::PathBuf;
use tracing::{info, warn};

use crate::campaign::{
    Campaign, CampaignData, CampaignMetadata, CampaignMode, CampaignStatus, ExampleRecord,
};
use crate::error::{CampaignError, Result};
use crate::io::{check_id, read_jsonl, write_json_pretty, write_jsonl};

const METADATA_FILE: &str = "metadata.json";
const DB_FILE: &str = "db.jsonl";

#[derive(Debug, Clone)]
pub struct CampaignStore {
    root: PathBuf,
    render_dir: Option<PathBuf>,
}

impl CampaignStore {
    pub fn new(root: PathBuf, render_dir: Option<PathBuf>) -> Self {
        Self { root, render_dir }
    }

    /// Rejects ids that are not a single path component.
    pub fn campaign_dir(&self, id: &str) -> Result<PathBuf> {
        Ok(self.root.join(check_id("campaign", id)?))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.campaign_dir(id).is_ok_and(|dir| dir.join(METADATA_FILE).exists())
    }

    /// Directory names under the root. Missing root means no campaigns.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let rd = match std::fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for ent in rd {
            let ent = ent?;
            if ent.file_type()?.is_dir() {
                ids.push(ent.file_name().to_string_lossy().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn load(&self, id: &str) -> Result<Campaign> {
        let dir = self.campaign_dir(id)?;
        let meta_path = dir.join(METADATA_FILE);
        let raw = std::fs::read_to_string(&meta_path)
            .map_err(|_| CampaignError::NotFound(id.to_string()))?;
        let metadata: CampaignMetadata = serde_json::from_str(&raw).map_err(|e| {
            warn!(campaign = id, "malformed metadata: {e}");
            CampaignError::NotFound(id.to_string())
        })?;
        let examples = match read_jsonl::<ExampleRecord>(&dir.join(DB_FILE)) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Campaign::from_parts(&dir, metadata, examples))
    }

    pub fn create(
        &self,
        mode: CampaignMode,
        id: &str,
        config: serde_json::Value,
        examples: Vec<ExampleRecord>,
    ) -> Result<Campaign> {
        let dir = self.campaign_dir(id)?;
        if dir.exists() {
            return Err(CampaignError::AlreadyExists(format!("campaign {id}")));
        }
        std::fs::create_dir_all(dir.join("files"))?;
        let metadata = CampaignMetadata::new(id, mode, config);
        let campaign = Campaign::from_parts(&dir, metadata, examples);
        self.save_metadata(campaign.data())?;
        self.save_db(campaign.data())?;
        info!(
            campaign = id,
            mode = mode.as_str(),
            examples = campaign.data().examples.len(),
            "campaign created"
        );
        Ok(campaign)
    }

    pub fn save_metadata(&self, data: &CampaignData) -> Result<()> {
        write_json_pretty(&data.dir.join(METADATA_FILE), &data.metadata)
    }

    pub fn save_db(&self, data: &CampaignData) -> Result<()> {
        write_jsonl(&data.dir.join(DB_FILE), &data.examples)
    }

    /// Removes the campaign directory and any render artifacts generated for it.
    pub fn delete(&self, id: &str) -> Result<()> {
        let dir = self.campaign_dir(id)?;
        if !dir.exists() {
            return Err(CampaignError::NotFound(id.to_string()));
        }
        std::fs::remove_dir_all(&dir)?;
        if let Some(render_dir) = &self.render_dir {
            let artifacts = render_dir.join(id);
            if artifacts.exists() {
                std::fs::remove_dir_all(&artifacts)?;
            }
        }
        info!(campaign = id, "campaign deleted");
        Ok(())
    }

    /// Copy config and examples into a fresh idle campaign.
    pub fn duplicate(&self, source: &Campaign, new_id: &str) -> Result<Campaign> {
        let mut examples = source.data().examples.clone();
        examples.iter_mut().for_each(ExampleRecord::reset);
        self.create(source.mode(), new_id, source.metadata().config.clone(), examples)
    }

    /// Drop every produced record and return the campaign to a fresh idle state.
    pub fn clear_all_outputs(&self, campaign: &mut Campaign) -> Result<()> {
        let data = campaign.data_mut();
        let files = data.files_dir();
        if files.exists() {
            std::fs::remove_dir_all(&files)?;
        }
        std::fs::create_dir_all(&files)?;
        data.examples.iter_mut().for_each(ExampleRecord::reset);
        data.metadata.status = CampaignStatus::Idle;
        data.metadata.last_error = None;
        self.save_db(data)?;
        self.save_metadata(data)
    }

    /// Reset one example and remove its records from `files/`.
    pub fn clear_output(&self, campaign: &mut Campaign, position: usize) -> Result<()> {
        let data = campaign.data_mut();
        let example = data
            .examples
            .get_mut(position)
            .ok_or_else(|| {
                CampaignError::NotFound(format!("example {position} in {}", data.metadata.id))
            })?;
        example.reset();
        let example = example.clone();

        let files = data.files_dir();
        if files.exists() {
            for ent in std::fs::read_dir(&files)? {
                let path = ent?.path();
                if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                    continue;
                }
                let rows: Vec<serde_json::Value> = read_jsonl(&path)?;
                let kept: Vec<_> =
                    rows.into_iter().filter(|row| !record_matches(row, &example)).collect();
                write_jsonl(&path, &kept)?;
            }
        }
        if data.metadata.status == CampaignStatus::Finished {
            data.metadata.status = CampaignStatus::Idle;
        }
        self.save_db(data)?;
        self.save_metadata(data)
    }
}

fn record_matches(row: &serde_json::Value, ex: &ExampleRecord) -> bool {
    let same_setup = match &ex.setup_id {
        Some(setup) => row.get("setup_id").and_then(|v| v.as_str()) == Some(setup.as_str()),
        None => true,
    };
    row.get("dataset").and_then(|v| v.as_str()) == Some(ex.dataset.as_str())
        && row.get("split").and_then(|v| v.as_str()) == Some(ex.split.as_str())
        && row.get("example_idx").and_then(|v| v.as_u64()) == Some(ex.example_idx as u64)
        && same_setup
}
