//! Campaign config -> model. Prompt building, structured-annotation parsing
//! and generation post-processing live here; transport lives in `providers`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::campaign::CampaignMode;
use crate::error::{CampaignError, Result};
use crate::providers::{Backend, ChatMessage, ClientFactory, CompletionRequest, ModelClient};
use crate::records::SpanAnnotation;

const EVAL_REQUIRED: &[&str] = &["type", "annotation_span_categories", "prompt_template", "model"];
const EVAL_OPTIONAL: &[&str] = &[
    "system_msg",
    "start_with",
    "annotation_overlap_allowed",
    "model_args",
    "api_url",
    "extra_args",
];
const GEN_REQUIRED: &[&str] = &["type", "prompt_template", "model"];
const GEN_OPTIONAL: &[&str] = &["model_args", "system_msg", "api_url", "extra_args", "start_with"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtraArgs {
    #[serde(default)]
    pub stopping_sequence: Option<String>,
    #[serde(default)]
    pub remove_suffix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(rename = "type")]
    pub model_type: String,
    pub model: String,
    pub prompt_template: String,
    #[serde(default)]
    pub system_msg: String,
    #[serde(default)]
    pub start_with: String,
    #[serde(default)]
    pub annotation_span_categories: Vec<serde_json::Value>,
    #[serde(default)]
    pub annotation_overlap_allowed: bool,
    #[serde(default)]
    pub model_args: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub extra_args: ExtraArgs,
}

impl LlmConfig {
    /// Check required keys and types for `mode`; unknown keys only warn.
    pub fn parse(raw: &serde_json::Value, mode: CampaignMode) -> Result<Self> {
        let (required, optional) = match mode {
            CampaignMode::LlmEval => (EVAL_REQUIRED, EVAL_OPTIONAL),
            CampaignMode::LlmGen => (GEN_REQUIRED, GEN_OPTIONAL),
            other => {
                let msg = format!("mode {} has no model", other.as_str());
                return Err(CampaignError::InvalidConfig(msg));
            }
        };
        let obj = raw
            .as_object()
            .ok_or_else(|| CampaignError::InvalidConfig("config must be a mapping".into()))?;
        for field in required {
            if !obj.contains_key(*field) {
                let keys: Vec<&String> = obj.keys().collect();
                return Err(CampaignError::InvalidConfig(format!(
                    "Field `{field}` is missing in the config. Keys: {keys:?}"
                )));
            }
        }
        for key in obj.keys() {
            if !required.contains(&key.as_str()) && !optional.contains(&key.as_str()) {
                warn!("Field `{key}` is not recognized in the config.");
            }
        }
        let mut cfg: LlmConfig = serde_json::from_value(raw.clone())
            .map_err(|e| CampaignError::InvalidConfig(e.to_string()))?;
        if mode == CampaignMode::LlmEval && cfg.annotation_span_categories.is_empty() {
            return Err(CampaignError::InvalidConfig(
                "`annotation_span_categories` must not be empty".into(),
            ));
        }
        parse_model_args(&mut cfg.model_args);
        Ok(cfg)
    }
}

/// String values that read as JSON literals ("0.7", "true", "[1, 2]") become typed values.
fn parse_model_args(args: &mut serde_json::Map<String, serde_json::Value>) {
    for value in args.values_mut() {
        if let serde_json::Value::String(s) = value {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(s) {
                *value = parsed;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSpan {
    #[serde(default)]
    reason: String,
    text: String,
    annotation_type: usize,
}

#[derive(Debug, Deserialize)]
struct OutputAnnotations {
    annotations: Vec<RawSpan>,
}

pub fn annotation_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "annotations": {
                "type": "array",
                "description": "The list of annotations.",
                "items": {
                    "type": "object",
                    "properties": {
                        "reason": {
                            "type": "string",
                            "description": "The reason for the annotation."
                        },
                        "text": {"type": "string", "description": "The text which is annotated."},
                        "annotation_type": {
                            "type": "integer",
                            "description": "Index to the list of span annotation types defined for the annotation campaign."
                        }
                    },
                    "required": ["reason", "text", "annotation_type"]
                }
            }
        },
        "required": ["annotations"]
    })
}

fn lower_chars(s: &str) -> Vec<char> {
    s.chars().map(|c| c.to_lowercase().next().unwrap_or(c)).collect()
}

fn find_from(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() || needle.len() > haystack.len() - from {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| haystack[i..i + needle.len()] == *needle)
}

/// Locate each span of a structured response in `text` (char offsets).
///
/// Spans are matched case-insensitively at or after a cursor that moves to
/// the match start when overlaps are allowed and to the match end otherwise.
/// Spans that cannot be found are dropped.
pub fn parse_annotations(text: &str, response: &str, overlap_allowed: bool) -> Vec<SpanAnnotation> {
    let parsed: OutputAnnotations = match serde_json::from_str(response) {
        Ok(p) => p,
        Err(e) => {
            error!("Model response is not in the expected format: {e}. Response: {response:?}");
            return Vec::new();
        }
    };
    let haystack = lower_chars(text);
    let mut cursor = 0;
    let mut spans = Vec::new();
    for raw in parsed.annotations {
        let needle = lower_chars(&raw.text);
        let Some(start) = find_from(&haystack, &needle, cursor) else {
            warn!(span = %raw.text, cursor, "cannot find annotated text in output, dropping it");
            continue;
        };
        cursor = if overlap_allowed { start } else { start + needle.len() };
        spans.push(SpanAnnotation {
            annotation_type: raw.annotation_type,
            start,
            text: raw.text,
            reason: raw.reason,
        });
    }
    spans
}

/// Decode `\n`, `\t`, `\r` and `\\` written literally in YAML/JSON configs.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

pub fn postprocess_output(output: &str, extra: &ExtraArgs) -> String {
    let mut out = output;
    let stop = extra.stopping_sequence.as_deref().filter(|s| !s.is_empty()).map(unescape);
    if let Some(stop) = &stop {
        if let Some(pos) = out.find(stop.as_str()) {
            out = &out[..pos];
        }
    }
    let mut out = out.trim();
    if let Some(suffix) = extra.remove_suffix.as_deref().filter(|s| !s.is_empty()) {
        out = out.strip_suffix(suffix).unwrap_or(out);
    }
    out.trim().to_string()
}

fn data_for_prompt(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// What a model produced for one example.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    Annotations(Vec<SpanAnnotation>),
    Text(String),
}

impl ModelOutput {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ModelOutput::Annotations(a) => serde_json::json!({ "annotations": a }),
            ModelOutput::Text(t) => serde_json::json!({ "output": t }),
        }
    }
}

/// A resolved model for an LLM campaign.
#[derive(Clone)]
pub struct LlmModel {
    pub mode: CampaignMode,
    pub config: LlmConfig,
    pub backend: Backend,
    client: Arc<dyn ModelClient>,
}

impl LlmModel {
    /// Validate the config and resolve the backend. Fails before anything runs.
    pub fn from_config(
        raw: &serde_json::Value,
        mode: CampaignMode,
        factory: &dyn ClientFactory,
    ) -> Result<Self> {
        let config = LlmConfig::parse(raw, mode)?;
        let backend = Backend::parse(&config.model_type)?;
        let client = factory.client_for(backend, config.api_url.as_deref())?;
        Ok(Self { mode, config, backend, client })
    }

    pub fn client(&self) -> &Arc<dyn ModelClient> {
        &self.client
    }

    pub fn annotator_id(&self) -> String {
        format!("llm-{}-{}", self.config.model_type, self.config.model)
    }

    pub fn eval_prompt(&self, data: &serde_json::Value, text: &str) -> Result<String> {
        if text.is_empty() {
            return Err(CampaignError::InvalidState(
                "text to evaluate must be a non-empty string".into(),
            ));
        }
        Ok(self
            .config
            .prompt_template
            .replace("{data}", &data_for_prompt(data))
            .replace("{text}", text))
    }

    pub fn gen_prompt(&self, data: &serde_json::Value) -> String {
        self.config
            .prompt_template
            .replace("{{", "{")
            .replace("}}", "}")
            .replace("{data}", &data_for_prompt(data))
    }

    /// Build the request for one example. `text` is the output under evaluation.
    pub fn request_for(
        &self,
        data: &serde_json::Value,
        text: Option<&str>,
    ) -> Result<(String, CompletionRequest)> {
        let mut messages = Vec::new();
        if !self.config.system_msg.is_empty() {
            messages.push(ChatMessage::new("system", &self.config.system_msg));
        }
        let (prompt, schema) = match self.mode {
            CampaignMode::LlmEval => {
                (self.eval_prompt(data, text.unwrap_or_default())?, Some(annotation_schema()))
            }
            _ => (self.gen_prompt(data), None),
        };
        messages.push(ChatMessage::new("user", &prompt));
        if self.mode == CampaignMode::LlmGen && !self.config.start_with.is_empty() {
            messages.push(ChatMessage::new("assistant", &self.config.start_with));
        }
        debug!(model = %self.config.model, backend = ?self.backend, "built model request");
        let req = CompletionRequest {
            model: self.config.model.clone(),
            messages,
            response_schema: schema,
            model_args: self.config.model_args.clone(),
        };
        Ok((prompt, req))
    }

    pub fn interpret(&self, response: &str, text: Option<&str>) -> ModelOutput {
        match self.mode {
            CampaignMode::LlmEval => ModelOutput::Annotations(parse_annotations(
                text.unwrap_or_default(),
                response,
                self.config.annotation_overlap_allowed,
            )),
            _ => ModelOutput::Text(postprocess_output(response, &self.config.extra_args)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MockClient, StaticClientFactory};

    fn eval_cfg() -> serde_json::Value {
        serde_json::json!({
            "type": "mock",
            "model": "tiny",
            "prompt_template": "Data: {data}\nText: {text}",
            "annotation_span_categories": [{"name": "Incorrect"}, {"name": "Misleading"}],
            "model_args": {"temperature": "0.2", "seed": 7, "note": "not json"}
        })
    }

    #[test]
    fn missing_required_field_is_reported() {
        let raw = serde_json::json!({"type": "openai", "model": "m"});
        let err = LlmConfig::parse(&raw, CampaignMode::LlmGen).unwrap_err();
        assert!(err.to_string().contains("prompt_template"));
    }

    #[test]
    fn wrong_type_is_invalid() {
        let raw = serde_json::json!({"type": "openai", "model": 3, "prompt_template": "x"});
        assert!(matches!(
            LlmConfig::parse(&raw, CampaignMode::LlmGen),
            Err(CampaignError::InvalidConfig(_))
        ));
    }

    #[test]
    fn model_args_literals_are_converted() {
        let cfg = LlmConfig::parse(&eval_cfg(), CampaignMode::LlmEval).unwrap();
        assert_eq!(cfg.model_args["temperature"], serde_json::json!(0.2));
        assert_eq!(cfg.model_args["seed"], 7);
        assert_eq!(cfg.model_args["note"], "not json");
    }

    #[test]
    fn eval_needs_categories() {
        let mut raw = eval_cfg();
        raw["annotation_span_categories"] = serde_json::json!([]);
        assert!(LlmConfig::parse(&raw, CampaignMode::LlmEval).is_err());
    }

    #[test]
    fn spans_are_located_case_insensitively() {
        let text = "The Sun is cold. The sun is blue.";
        let resp = r#"{"annotations": [
            {"reason": "wrong", "text": "the sun is", "annotation_type": 0},
            {"reason": "wrong", "text": "THE SUN IS", "annotation_type": 1}
        ]}"#;
        let spans = parse_annotations(text, resp, false);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].start, 0);
        assert_eq!(spans[1].start, 17);
        assert_eq!(spans[1].annotation_type, 1);
    }

    #[test]
    fn overlap_policy_moves_cursor_to_start() {
        let text = "big red ball";
        let resp = r#"{"annotations": [
            {"reason": "", "text": "big red", "annotation_type": 0},
            {"reason": "", "text": "red ball", "annotation_type": 0}
        ]}"#;
        assert_eq!(parse_annotations(text, resp, false).len(), 1);
        let spans = parse_annotations(text, resp, true);
        assert_eq!(spans.iter().map(|s| s.start).collect::<Vec<_>>(), vec![0, 4]);
    }

    #[test]
    fn missing_span_is_dropped_others_kept() {
        let text = "Oslo is warm today.";
        let resp = r#"{"annotations": [
            {"reason": "r", "text": "Bergen", "annotation_type": 0},
            {"reason": "r", "text": "warm", "annotation_type": 0}
        ]}"#;
        let spans = parse_annotations(text, resp, false);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "warm");
        assert_eq!(spans[0].start, 8);
    }

    #[test]
    fn unparsable_response_yields_nothing() {
        assert!(parse_annotations("text", "sorry, I can't", false).is_empty());
    }

    #[test]
    fn offsets_count_chars_not_bytes() {
        let response = r#"{"annotations":[{"reason":"","text":"rain","annotation_type":0}]}"#;
        let spans = parse_annotations("Zürich é rain", response, false);
        assert_eq!(spans[0].start, 9);
    }

    #[test]
    fn postprocess_cuts_and_strips() {
        let extra = ExtraArgs {
            stopping_sequence: Some("\\n\\n".into()),
            remove_suffix: Some("</s>".into()),
        };
        assert_eq!(postprocess_output("  First part.</s>\n\nSecond", &extra), "First part.");
        assert_eq!(postprocess_output(" plain ", &ExtraArgs::default()), "plain");
    }

    #[test]
    fn prompts_substitute_placeholders() {
        let factory = StaticClientFactory(Arc::new(MockClient::echo()));
        let model = LlmModel::from_config(&eval_cfg(), CampaignMode::LlmEval, &factory).unwrap();
        let data = serde_json::json!({"t": 1});
        assert_eq!(model.eval_prompt(&data, "hi").unwrap(), "Data: {\"t\":1}\nText: hi");
        assert!(model.eval_prompt(&data, "").is_err());
        assert_eq!(model.annotator_id(), "llm-mock-tiny");

        let (_, req) = model.request_for(&data, Some("hi")).unwrap();
        assert!(req.response_schema.is_some());

        let gen_raw = serde_json::json!({
            "type": "mock",
            "model": "tiny",
            "prompt_template": "{{x}} {data}",
            "start_with": "Answer:"
        });
        let gen = LlmModel::from_config(&gen_raw, CampaignMode::LlmGen, &factory).unwrap();
        assert_eq!(gen.gen_prompt(&serde_json::json!("row")), "{x} row");
        let (_, req) = gen.request_for(&serde_json::json!("row"), None).unwrap();
        assert_eq!(req.messages.last().unwrap().role, "assistant");
    }
}
