#![allow(dead_code)]

use std::sync::Arc;

use annogen::config::AppConfig;
use annogen::events::RunEvent;
use annogen::providers::{ModelClient, StaticClientFactory};
use annogen::AppContext;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub struct Fixture {
    pub dir: TempDir,
    pub ctx: AppContext,
}

pub fn fixture(client: Arc<dyn ModelClient>) -> Fixture {
    fixture_with(client, |_| {})
}

pub fn fixture_with(client: Arc<dyn ModelClient>, tweak: impl FnOnce(&mut AppConfig)) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = AppConfig::with_data_dir(dir.path());
    cfg.runner.backoff_base_ms = 0;
    cfg.runner.backoff_jitter_ms = 0;
    tweak(&mut cfg);
    cfg.ensure_dirs().expect("data dirs");
    let ctx = AppContext::new(cfg, Arc::new(StaticClientFactory(client)));
    Fixture { dir, ctx }
}

/// Write `<input>/<dataset>/<split>.jsonl`.
pub fn write_dataset(ctx: &AppContext, dataset: &str, split: &str, rows: &[serde_json::Value]) {
    let dir = ctx.config.input_dir().join(dataset);
    std::fs::create_dir_all(&dir).unwrap();
    let body: String = rows.iter().map(|r| format!("{r}\n")).collect();
    std::fs::write(dir.join(format!("{split}.jsonl")), body).unwrap();
}

pub fn gen_config() -> serde_json::Value {
    serde_json::json!({"type": "mock", "model": "m", "prompt_template": "Describe: {data}"})
}

pub fn eval_config() -> serde_json::Value {
    serde_json::json!({
        "type": "mock",
        "model": "m",
        "prompt_template": "Data: {data}\nText: {text}",
        "annotation_span_categories": [{"name": "Incorrect", "color": "#ff0000"}]
    })
}

/// Subscribe ahead of a run so no event is missed.
pub fn subscribe(ctx: &AppContext, id: &str) -> broadcast::Receiver<RunEvent> {
    ctx.state.lock().announcers.get_or_create(id, ctx.config.runner.announcer_capacity).subscribe()
}

pub async fn events_until_terminal(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    loop {
        let evt = rx.recv().await.expect("announcer closed");
        let done = evt.is_terminal();
        events.push(evt);
        if done {
            return events;
        }
    }
}

pub fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}
