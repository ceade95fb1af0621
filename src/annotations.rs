use serde::{Deserialize, Serialize};
use slug::slugify;
use tracing::{error, info, warn};

use crate::campaign::{now_timestamp, Campaign, CampaignMode, ExampleRecord, ExampleStatus};
use crate::error::{CampaignError, Result};
use crate::io::{append_jsonl, read_jsonl};
use crate::records::AnnotationRecord;
use crate::store::CampaignStore;

/// An annotation record together with the span categories its campaign defines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedAnnotation {
    #[serde(flatten)]
    pub record: AnnotationRecord,
    #[serde(default)]
    pub annotation_span_categories: Vec<serde_json::Value>,
}

fn span_categories(campaign: &Campaign) -> Vec<serde_json::Value> {
    campaign
        .metadata()
        .config
        .get("annotation_span_categories")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Every annotation recorded by the given campaigns. Hidden and generation
/// campaigns carry no annotations and are skipped.
pub fn index(campaigns: &[Campaign]) -> Vec<IndexedAnnotation> {
    let mut all = Vec::new();
    for campaign in campaigns {
        if !campaign.has_annotations() {
            continue;
        }
        let categories = span_categories(campaign);
        let files = campaign.data().files_dir();
        let rd = match std::fs::read_dir(&files) {
            Ok(rd) => rd,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(campaign = campaign.id(), "cannot list annotation files: {e}");
                }
                continue;
            }
        };
        for ent in rd.filter_map(|e| e.ok()) {
            let path = ent.path();
            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }
            match read_jsonl::<AnnotationRecord>(&path) {
                Ok(records) => all.extend(records.into_iter().map(|record| IndexedAnnotation {
                    record,
                    annotation_span_categories: categories.clone(),
                })),
                Err(e) => error!(file = %path.display(), "error reading annotation file: {e}"),
            }
        }
    }
    all
}

pub fn for_output(
    campaigns: &[Campaign],
    dataset: &str,
    split: &str,
    example_idx: usize,
    setup_id: &str,
) -> Vec<IndexedAnnotation> {
    index(campaigns)
        .into_iter()
        .filter(|a| {
            let r = &a.record;
            slugify(&r.dataset) == slugify(dataset)
                && slugify(&r.split) == slugify(split)
                && r.example_idx == example_idx
                && slugify(&r.setup_id) == slugify(setup_id)
        })
        .collect()
}

fn ensure_human(campaign: &Campaign) -> Result<()> {
    match campaign.mode() {
        CampaignMode::Crowdsourcing | CampaignMode::External => Ok(()),
        other => Err(CampaignError::InvalidState(format!(
            "campaign {} in mode {} does not take human annotations",
            campaign.id(),
            other.as_str()
        ))),
    }
}

/// Hand the first batch with free examples to `annotator_id`.
/// Returns the assigned examples, empty when nothing is left.
pub fn assign_batch(
    store: &CampaignStore,
    campaign: &mut Campaign,
    annotator_id: &str,
) -> Result<Vec<ExampleRecord>> {
    ensure_human(campaign)?;
    let data = campaign.data_mut();
    let Some(batch_idx) =
        data.examples.iter().filter(|e| e.status == ExampleStatus::Free).map(|e| e.batch_idx).min()
    else {
        info!(campaign = %data.metadata.id, annotator_id, "no free batch left");
        return Ok(Vec::new());
    };
    let start = now_timestamp();
    let mut assigned = Vec::new();
    for ex in data.examples.iter_mut() {
        if ex.batch_idx != batch_idx || ex.status != ExampleStatus::Free {
            continue;
        }
        ex.status = ExampleStatus::Assigned;
        ex.annotator_id = Some(annotator_id.to_string());
        ex.start = Some(start.clone());
        assigned.push(ex.clone());
    }
    store.save_db(data)?;
    info!(
        campaign = %data.metadata.id,
        annotator_id,
        batch_idx,
        examples = assigned.len(),
        "batch assigned"
    );
    Ok(assigned)
}

/// Store submitted annotations and mark their examples finished.
/// Every record must refer to an example of the campaign; nothing is written otherwise.
pub fn submit(
    store: &CampaignStore,
    campaign: &mut Campaign,
    annotator_id: &str,
    records: Vec<AnnotationRecord>,
) -> Result<usize> {
    ensure_human(campaign)?;
    let campaign_id = campaign.id().to_string();
    let data = campaign.data_mut();
    let mut positions = Vec::with_capacity(records.len());
    for r in &records {
        let pos = data
            .examples
            .iter()
            .position(|e| e.matches(&r.dataset, &r.split, r.example_idx, Some(r.setup_id.as_str())))
            .or_else(|| {
                data.examples.iter().position(|e| {
                    e.setup_id.is_none() && e.matches(&r.dataset, &r.split, r.example_idx, None)
                })
            })
            .ok_or_else(|| {
                CampaignError::NotFound(format!(
                    "example {}/{}/{} in {campaign_id}",
                    r.dataset, r.split, r.example_idx
                ))
            })?;
        positions.push(pos);
    }

    let path = data.files_dir().join(format!("{}.jsonl", slugify(annotator_id)));
    for mut r in records {
        r.annotator_id = annotator_id.to_string();
        r.campaign_id = campaign_id.clone();
        append_jsonl(&path, &r)?;
    }
    for &pos in &positions {
        let ex = &mut data.examples[pos];
        if ex.annotator_id.as_deref().is_some_and(|a| a != annotator_id) {
            warn!(
                campaign = %campaign_id,
                position = pos,
                "example was assigned to another annotator"
            );
        }
        ex.status = ExampleStatus::Finished;
        ex.annotator_id = Some(annotator_id.to_string());
    }
    store.save_db(data)?;
    info!(
        campaign = %campaign_id,
        annotator_id,
        submitted = positions.len(),
        "annotations submitted"
    );
    Ok(positions.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::SpanAnnotation;

    fn crowd(store: &CampaignStore) -> Campaign {
        let mut examples = Vec::new();
        for (i, batch) in [0usize, 0, 1].iter().enumerate() {
            let mut ex = ExampleRecord::new("d", "dev", i, Some("sys"));
            ex.batch_idx = *batch;
            examples.push(ex);
        }
        let config = serde_json::json!({
            "annotation_span_categories": [{"name": "Error", "color": "red"}]
        });
        store.create(CampaignMode::Crowdsourcing, "crowd", config, examples).unwrap()
    }

    fn record(idx: usize) -> AnnotationRecord {
        AnnotationRecord {
            annotator_id: String::new(),
            annotator_group: 0,
            campaign_id: String::new(),
            dataset: "d".into(),
            split: "dev".into(),
            example_idx: idx,
            setup_id: "sys".into(),
            annotations: vec![SpanAnnotation {
                annotation_type: 0,
                start: 0,
                text: "x".into(),
                reason: String::new(),
            }],
            flags: vec![],
            options: vec![],
            text_fields: vec![],
            metadata: None,
        }
    }

    #[test]
    fn batches_are_handed_out_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = CampaignStore::new(dir.path().to_path_buf(), None);
        let mut c = crowd(&store);

        let first = assign_batch(&store, &mut c, "ann-1").unwrap();
        assert_eq!(first.iter().map(|e| e.example_idx).collect::<Vec<_>>(), vec![0, 1]);
        let second = assign_batch(&store, &mut c, "ann-2").unwrap();
        assert_eq!(second.len(), 1);
        assert!(assign_batch(&store, &mut c, "ann-3").unwrap().is_empty());
        assert_eq!(store.load("crowd").unwrap().data().stats().assigned, 3);
    }

    #[test]
    fn submitted_annotations_are_indexed_with_categories() {
        let dir = tempfile::tempdir().unwrap();
        let store = CampaignStore::new(dir.path().to_path_buf(), None);
        let mut c = crowd(&store);
        assign_batch(&store, &mut c, "ann-1").unwrap();

        assert_eq!(submit(&store, &mut c, "ann-1", vec![record(0), record(1)]).unwrap(), 2);
        assert_eq!(c.data().stats().finished, 2);

        let found = for_output(&[c.clone()], "d", "dev", 1, "sys");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].record.annotator_id, "ann-1");
        assert_eq!(found[0].record.campaign_id, "crowd");
        assert_eq!(found[0].annotation_span_categories[0]["name"], "Error");
    }

    #[test]
    fn unknown_example_rejects_whole_submission() {
        let dir = tempfile::tempdir().unwrap();
        let store = CampaignStore::new(dir.path().to_path_buf(), None);
        let mut c = crowd(&store);
        assert!(submit(&store, &mut c, "ann-1", vec![record(0), record(9)]).is_err());
        assert!(index(&[c]).is_empty());
    }

    #[test]
    fn generation_campaigns_are_not_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let store = CampaignStore::new(dir.path().to_path_buf(), None);
        let c = store.create(CampaignMode::LlmGen, "gen", serde_json::json!({}), vec![]).unwrap();
        let line = serde_json::to_string(&record(0)).unwrap();
        std::fs::write(c.data().files_dir().join("x.jsonl"), line).unwrap();
        assert!(index(&[c]).is_empty());
    }
}
