use serde::{Deserialize, Serialize};

/// One generated output, one line of an outputs JSONL file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub dataset: String,
    pub split: String,
    pub setup_id: String,
    pub example_idx: usize,
    pub out: Option<String>,
}

/// A generation campaign's record: the output plus the prompt that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    #[serde(flatten)]
    pub output: OutputRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A marked substring of an output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanAnnotation {
    #[serde(rename = "type")]
    pub annotation_type: usize,
    pub start: usize,
    pub text: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationRecord {
    #[serde(default)]
    pub annotator_id: String,
    #[serde(default)]
    pub annotator_group: u32,
    #[serde(default)]
    pub campaign_id: String,
    pub dataset: String,
    pub split: String,
    pub example_idx: usize,
    pub setup_id: String,
    #[serde(default)]
    pub annotations: Vec<SpanAnnotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub text_fields: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_uses_short_type_key() {
        let span = SpanAnnotation {
            annotation_type: 2,
            start: 4,
            text: "rain".into(),
            reason: "wrong".into(),
        };
        let v = serde_json::to_value(&span).unwrap();
        assert_eq!(v["type"], 2);
        assert!(v.get("annotation_type").is_none());
    }

    #[test]
    fn generation_record_flattens_output_keys() {
        let rec = GenerationRecord {
            output: OutputRecord {
                dataset: "ice-hockey".into(),
                split: "dev".into(),
                setup_id: "gen-1".into(),
                example_idx: 3,
                out: Some("Team A won.".into()),
            },
            metadata: Some(serde_json::json!({"prompt": "p"})),
        };
        let line = serde_json::to_string(&rec).unwrap();
        let back: OutputRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, rec.output);
    }
}
