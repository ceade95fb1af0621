use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::{CampaignError, Result};
use crate::io::{check_id, read_jsonl};

/// A dataset read from `<input_dir>/<id>/<split>.jsonl`, one example per line.
#[derive(Debug)]
pub struct Dataset {
    pub id: String,
    splits: BTreeMap<String, Vec<serde_json::Value>>,
}

impl Dataset {
    pub fn splits(&self) -> Vec<String> {
        self.splits.keys().cloned().collect()
    }

    pub fn example_count(&self, split: &str) -> usize {
        self.splits.get(split).map_or(0, Vec::len)
    }

    pub fn get_example(&self, split: &str, example_idx: usize) -> Result<&serde_json::Value> {
        self.splits
            .get(split)
            .and_then(|rows| rows.get(example_idx))
            .ok_or_else(|| {
                CampaignError::NotFound(format!("example {}/{split}/{example_idx}", self.id))
            })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetOverview {
    pub id: String,
    pub splits: Vec<String>,
    pub example_count: BTreeMap<String, usize>,
}

/// Lazily loaded, cached datasets.
pub struct DatasetRegistry {
    input_dir: PathBuf,
    loaded: RwLock<HashMap<String, Arc<Dataset>>>,
}

impl DatasetRegistry {
    pub fn new(input_dir: PathBuf) -> Self {
        Self { input_dir, loaded: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, id: &str) -> Result<Arc<Dataset>> {
        check_id("dataset", id)?;
        if let Some(ds) = self.loaded.read().get(id) {
            return Ok(ds.clone());
        }
        let ds = Arc::new(self.load(id)?);
        self.loaded.write().insert(id.to_string(), ds.clone());
        Ok(ds)
    }

    fn load(&self, id: &str) -> Result<Dataset> {
        let dir = self.input_dir.join(id);
        if !dir.is_dir() {
            return Err(CampaignError::NotFound(format!("dataset {id}")));
        }
        let mut splits = BTreeMap::new();
        for ent in std::fs::read_dir(&dir)? {
            let path = ent?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(split) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            splits.insert(split, read_jsonl(&path)?);
        }
        if splits.is_empty() {
            warn!(dataset = id, "dataset has no splits");
        }
        Ok(Dataset { id: id.to_string(), splits })
    }

    pub fn overview(&self) -> Vec<DatasetOverview> {
        let Ok(rd) = std::fs::read_dir(&self.input_dir) else { return Vec::new() };
        let mut ids: Vec<String> = rd
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| match self.get(&id) {
                Ok(ds) => Some(DatasetOverview {
                    id: id.clone(),
                    splits: ds.splits(),
                    example_count: ds.splits.iter().map(|(k, v)| (k.clone(), v.len())).collect(),
                }),
                Err(e) => {
                    error!(dataset = %id, "error while loading dataset: {e}");
                    None
                }
            })
            .collect()
    }
}
