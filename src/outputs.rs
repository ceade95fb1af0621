use serde::Serialize;
use slug::slugify;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::error::{CampaignError, Result};
use crate::campaign::Campaign;
use crate::io::{append_jsonl, check_id, read_jsonl, write_jsonl};
use crate::records::{GenerationRecord, OutputRecord};

/// Model outputs stored as `<root>/<dataset>/<split>-<setup_id>.jsonl`.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputGroup {
    pub dataset: String,
    pub split: String,
    pub setup_id: String,
    pub output_ids: Vec<usize>,
}

impl OutputStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Every part must be a bare file name so the path stays under the root.
    pub fn file_for(&self, dataset: &str, split: &str, setup_id: &str) -> Result<PathBuf> {
        check_id("dataset", dataset)?;
        check_id("split", split)?;
        check_id("setup", setup_id)?;
        Ok(self.root.join(dataset).join(format!("{split}-{setup_id}.jsonl")))
    }

    fn jsonl_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("jsonl"))
            .collect()
    }

    /// Every output under the root. Malformed lines are logged and skipped.
    pub fn index(&self) -> Vec<OutputRecord> {
        let mut outputs = Vec::new();
        for path in self.jsonl_files() {
            match read_output_file(&path) {
                Ok(records) => outputs.extend(records),
                Err(e) => error!(file = %path.display(), "error reading output file: {e}"),
            }
        }
        outputs
    }

    pub fn append(&self, record: &OutputRecord) -> Result<()> {
        append_jsonl(&self.file_for(&record.dataset, &record.split, &record.setup_id)?, record)
    }

    /// Store one output per line of `text`. The line count must match the split size.
    pub fn upload(
        &self,
        dataset: &str,
        split: &str,
        setup_id: &str,
        text: &str,
        expected: usize,
    ) -> Result<usize> {
        let setup_id = slugify(setup_id);
        let path = self.file_for(dataset, split, &setup_id)?;
        let lines: Vec<&str> = text.trim().split('\n').collect();
        if lines.len() != expected {
            return Err(CampaignError::InvalidState(format!(
                "Output count mismatch for {setup_id} in {split}: {} vs {expected}",
                lines.len()
            )));
        }
        let records: Vec<OutputRecord> = lines
            .iter()
            .enumerate()
            .map(|(i, out)| OutputRecord {
                dataset: dataset.to_string(),
                split: split.to_string(),
                setup_id: setup_id.clone(),
                example_idx: i,
                out: Some(out.to_string()),
            })
            .collect();
        write_jsonl(&path, &records)?;
        info!(
            dataset,
            split,
            setup_id = %setup_id,
            count = records.len(),
            "model outputs uploaded"
        );
        Ok(records.len())
    }

    /// Reads only the file for (dataset, split, setup).
    pub fn get(
        &self,
        dataset: &str,
        split: &str,
        setup_id: &str,
        example_idx: usize,
    ) -> Option<OutputRecord> {
        let setup_id = slugify(setup_id);
        let path = match self.file_for(dataset, split, &setup_id) {
            Ok(path) => path,
            Err(e) => {
                warn!(dataset, split, setup_id = %setup_id, "output lookup rejected: {e}");
                return None;
            }
        };
        if !path.exists() {
            return None;
        }
        let records = match read_output_file(&path) {
            Ok(records) => records,
            Err(e) => {
                error!(file = %path.display(), "error reading output file: {e}");
                return None;
            }
        };
        // `read_output_file` yields slugs.
        let (dataset, split) = (slugify(dataset), slugify(split));
        records.into_iter().find(|r| {
            r.dataset == dataset
                && r.split == split
                && r.setup_id == setup_id
                && r.example_idx == example_idx
        })
    }

    pub fn for_example(&self, dataset: &str, split: &str, example_idx: usize) -> Vec<OutputRecord> {
        let (dataset, split) = (slugify(dataset), slugify(split));
        self.index()
            .into_iter()
            .filter(|r| r.dataset == dataset && r.split == split && r.example_idx == example_idx)
            .collect()
    }

    pub fn example_ids(&self, dataset: &str, split: &str, setup_id: &str) -> Vec<usize> {
        let (dataset, split, setup_id) = (slugify(dataset), slugify(split), slugify(setup_id));
        let mut ids: Vec<usize> = self
            .index()
            .into_iter()
            .filter(|r| r.dataset == dataset && r.split == split && r.setup_id == setup_id)
            .map(|r| r.example_idx)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Outputs grouped by (dataset, split, setup). `non_empty` drops records without text.
    pub fn overview(&self, datasets: &[String], non_empty: bool) -> Vec<OutputGroup> {
        let mut groups: BTreeMap<(String, String, String), Vec<usize>> = BTreeMap::new();
        for r in self.index() {
            if !datasets.is_empty() && !datasets.contains(&r.dataset) {
                continue;
            }
            if non_empty && r.out.is_none() {
                continue;
            }
            groups.entry((r.dataset, r.split, r.setup_id)).or_default().push(r.example_idx);
        }
        groups
            .into_iter()
            .map(|((dataset, split, setup_id), output_ids)| OutputGroup {
                dataset,
                split,
                setup_id,
                output_ids,
            })
            .collect()
    }

    /// Publish a generation campaign's records under `setup_id = slug(model_name)`.
    /// Files for the same (dataset, split, setup) are replaced.
    pub fn save_generation_outputs(&self, campaign: &Campaign, model_name: &str) -> Result<usize> {
        let Campaign::LlmGen(data) = campaign else {
            return Err(CampaignError::InvalidState(format!(
                "{} is not a generation campaign",
                campaign.id()
            )));
        };
        let setup_id = slugify(model_name);
        if setup_id.is_empty() {
            return Err(CampaignError::InvalidState("model name must not be empty".into()));
        }
        let mut grouped: BTreeMap<(String, String), Vec<OutputRecord>> = BTreeMap::new();
        let files = data.files_dir();
        if files.exists() {
            for ent in std::fs::read_dir(&files)? {
                let path = ent?.path();
                if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                    continue;
                }
                for rec in read_jsonl::<GenerationRecord>(&path)? {
                    let mut out = rec.output;
                    out.setup_id = setup_id.clone();
                    grouped.entry((out.dataset.clone(), out.split.clone())).or_default().push(out);
                }
            }
        }
        let mut saved = 0;
        for ((dataset, split), mut records) in grouped {
            records.sort_by_key(|r| r.example_idx);
            write_jsonl(&self.file_for(&dataset, &split, &setup_id)?, &records)?;
            saved += records.len();
        }
        info!(campaign = campaign.id(), setup_id = %setup_id, saved, "generation outputs saved");
        Ok(saved)
    }

    /// Remove outputs of a dataset; `None` for split or setup matches everything.
    /// Files left empty are deleted. Returns the number of removed records.
    pub fn delete(
        &self,
        dataset: &str,
        split: Option<&str>,
        setup_id: Option<&str>,
    ) -> Result<usize> {
        let mut removed = 0;
        for path in self.jsonl_files() {
            let rows: Vec<serde_json::Value> = read_jsonl(&path)?;
            let before = rows.len();
            let kept: Vec<serde_json::Value> = rows
                .into_iter()
                .filter(|row| {
                    let field = |k: &str| row.get(k).and_then(|v| v.as_str()).map(slugify);
                    let hit = field("dataset").as_deref() == Some(dataset)
                        && split.map_or(true, |s| field("split").as_deref() == Some(s))
                        && setup_id.map_or(true, |s| field("setup_id").as_deref() == Some(s));
                    !hit
                })
                .collect();
            removed += before - kept.len();
            if kept.is_empty() {
                std::fs::remove_file(&path)?;
            } else if kept.len() != before {
                write_jsonl(&path, &kept)?;
            }
        }
        info!(dataset, ?split, ?setup_id, removed, "model outputs deleted");
        Ok(removed)
    }
}

fn read_output_file(path: &Path) -> Result<Vec<OutputRecord>> {
    let records: Vec<OutputRecord> = read_jsonl(path)?;
    Ok(records
        .into_iter()
        .map(|mut r| {
            r.dataset = slugify(&r.dataset);
            r.split = slugify(&r.split);
            r.setup_id = slugify(&r.setup_id);
            r
        })
        .collect())
}
