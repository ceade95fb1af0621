mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http_body_util::BodyExt;
use tower::ServiceExt;

use annogen::api::build_router;
use annogen::auth::hash_password;
use annogen::providers::MockClient;
use annogen::AppContext;

use common::*;

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder().method("DELETE").uri(uri).body(Body::empty()).unwrap()
}

/// POST with an empty JSON object.
fn post(uri: &str) -> Request<Body> {
    json("POST", uri, serde_json::json!({}))
}

fn json(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn wait_until_idle(ctx: &AppContext, id: &str) {
    for _ in 0..200 {
        if !ctx.state.lock().runs.is_live(id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run of {id} did not stop");
}

const WEATHER_ROME: &str = "/api/example?dataset=weather&split=dev&example_idx=1";

fn weather(ctx: &AppContext) {
    write_dataset(
        ctx,
        "weather",
        "dev",
        &[serde_json::json!({"city": "Oslo"}), serde_json::json!({"city": "Rome"})],
    );
}

#[tokio::test]
async fn health_is_public() {
    let fx = fixture(Arc::new(MockClient::echo()));
    let app = build_router(fx.ctx.clone());
    let (status, body) = send(&app, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn generation_campaign_lifecycle() {
    let fx = fixture(Arc::new(MockClient::scripted(["first", "second"])));
    weather(&fx.ctx);
    let app = build_router(fx.ctx.clone());

    let create = serde_json::json!({
        "mode": "llm_gen",
        "campaign_id": "Weather Gen",
        "config": gen_config(),
        "data": [{"dataset": "weather", "split": "dev"}]
    });
    let (status, body) = send(&app, json("POST", "/api/campaigns", create.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], "weather-gen");
    assert_eq!(body["stats"]["total"], 2);

    let (status, body) = send(&app, json("POST", "/api/campaigns", create)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "already_exists");

    let (status, body) = send(&app, post("/api/campaigns/weather-gen/run")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["run_id"].is_string());
    wait_until_idle(&fx.ctx, "weather-gen").await;

    let (status, body) = send(&app, get("/api/campaigns/weather-gen")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "finished");
    assert_eq!(body["stats"]["finished"], 2);
    assert_eq!(body["examples"].as_array().unwrap().len(), 2);

    let save = serde_json::json!({"model_name": "Gen Model"});
    let uri = "/api/campaigns/weather-gen/save-outputs";
    let (status, body) = send(&app, json("POST", uri, save)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["saved"], 2);

    let (status, body) = send(&app, get(WEATHER_ROME)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["city"], "Rome");
    assert_eq!(body["outputs"][0]["setup_id"], "gen-model");
    assert_eq!(body["outputs"][0]["out"], "second");

    let (status, body) = send(&app, get("/api/campaigns?mode=llm_gen")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, delete("/api/campaigns/weather-gen")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app, get("/api/campaigns/weather-gen")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

/// Read SSE frames until a terminal event. Returns (event, data) pairs.
async fn read_sse_until_terminal(mut body: Body) -> Vec<(String, serde_json::Value)> {
    let mut buf = String::new();
    let mut frames = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("progress stream stalled")
            .expect("progress stream ended")
            .unwrap();
        let Ok(chunk) = frame.into_data() else { continue };
        buf.push_str(std::str::from_utf8(&chunk).unwrap());
        while let Some(end) = buf.find("\n\n") {
            let block: String = buf.drain(..end + 2).collect();
            let mut event = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(v) = line.strip_prefix("event: ") {
                    event = Some(v.to_string());
                } else if let Some(v) = line.strip_prefix("data: ") {
                    data = Some(serde_json::from_str(v).unwrap());
                }
            }
            if let (Some(event), Some(data)) = (event, data) {
                let terminal = matches!(event.as_str(), "finished" | "paused" | "failed");
                frames.push((event, data));
                if terminal {
                    return frames;
                }
            }
        }
    }
}

#[tokio::test]
async fn progress_stream_renders_run_events() {
    let fx = fixture(Arc::new(MockClient::scripted(["first", "second"])));
    weather(&fx.ctx);
    let app = build_router(fx.ctx.clone());
    let create = serde_json::json!({
        "mode": "llm_gen",
        "campaign_id": "gen",
        "config": gen_config(),
        "data": [{"dataset": "weather", "split": "dev"}]
    });
    let (status, _) = send(&app, json("POST", "/api/campaigns", create)).await;
    assert_eq!(status, StatusCode::CREATED);
    drop(subscribe(&fx.ctx, "gen"));

    let resp = app.clone().oneshot(get("/api/campaigns/gen/progress")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/event-stream"));

    let (status, _) = send(&app, post("/api/campaigns/gen/run")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let frames = read_sse_until_terminal(resp.into_body()).await;
    let kinds: Vec<&str> = frames.iter().map(|(e, _)| e.as_str()).collect();
    assert_eq!(kinds, vec!["started", "progress", "progress", "finished"]);
    for (event, data) in &frames {
        assert_eq!(&data["type"], event);
        assert_eq!(data["campaign_id"], "gen");
    }
    assert_eq!(frames[1].1["position"], 0);
    assert_eq!(frames[2].1["position"], 1);
    assert_eq!(frames[2].1["example_idx"], 1);
    assert_eq!(frames[3].1["done"], 2);
}

#[tokio::test]
async fn ids_cannot_reach_outside_their_directories() {
    let fx = fixture(Arc::new(MockClient::echo()));
    weather(&fx.ctx);
    let app = build_router(fx.ctx.clone());
    let create = serde_json::json!({
        "mode": "llm_gen",
        "campaign_id": "gen",
        "config": gen_config(),
        "data": [{"dataset": "weather", "split": "dev"}]
    });
    let (status, _) = send(&app, json("POST", "/api/campaigns", create)).await;
    assert_eq!(status, StatusCode::CREATED);
    let dataset_file = fx.ctx.config.input_dir().join("weather").join("dev.jsonl");

    let req = delete("/api/campaigns/%2E%2E");
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_state");
    assert!(dataset_file.exists());
    assert!(fx.ctx.store.exists("gen"));

    let (status, _) = send(&app, get("/api/campaigns/%2E%2E")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let escaping = "/api/example?dataset=..%2Fcampaigns%2Fgen&split=db&example_idx=0";
    let (status, _) = send(&app, get(escaping)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let upload = serde_json::json!({
        "dataset": "../campaigns/gen",
        "split": "db",
        "setup_id": "x",
        "outputs": "a"
    });
    let (status, _) = send(&app, json("POST", "/api/outputs", upload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let upload = serde_json::json!({
        "dataset": "weather",
        "split": "../../campaigns/gen/files/x",
        "setup_id": "y",
        "outputs": "a"
    });
    let (status, _) = send(&app, json("POST", "/api/outputs", upload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!fx.ctx.config.campaigns_dir().join("gen").join("db-x.jsonl").exists());
    let files = fx.ctx.config.campaigns_dir().join("gen").join("files");
    assert!(std::fs::read_dir(files).unwrap().next().is_none());
}

#[tokio::test]
async fn invalid_requests_map_to_client_errors() {
    let fx = fixture(Arc::new(MockClient::echo()));
    weather(&fx.ctx);
    let app = build_router(fx.ctx.clone());

    let bad_config = serde_json::json!({
        "mode": "llm_gen",
        "config": {"type": "mock", "model": "m"},
        "data": [{"dataset": "weather", "split": "dev"}]
    });
    let (status, body) = send(&app, json("POST", "/api/campaigns", bad_config)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_config");

    let (status, _) = send(&app, get("/api/campaigns?mode=nonsense")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, post("/api/campaigns/ghost/run")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, get("/api/campaigns/ghost/progress")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, post("/api/campaigns/ghost/pause")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paused"], false);
}

#[tokio::test]
async fn outputs_upload_list_and_delete() {
    let fx = fixture(Arc::new(MockClient::echo()));
    weather(&fx.ctx);
    let app = build_router(fx.ctx.clone());

    let upload = serde_json::json!({
        "dataset": "weather",
        "split": "dev",
        "setup_id": "Sys A",
        "outputs": "only one"
    });
    let (status, _) = send(&app, json("POST", "/api/outputs", upload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let upload = serde_json::json!({
        "dataset": "weather",
        "split": "dev",
        "setup_id": "Sys A",
        "outputs": "cold\nwarm\n"
    });
    let (status, body) = send(&app, json("POST", "/api/outputs", upload)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["count"], 2);
    assert_eq!(body["setup_id"], "sys-a");

    let (_, body) = send(&app, get("/api/outputs")).await;
    assert_eq!(body[0]["setup_id"], "sys-a");
    assert_eq!(body[0]["output_ids"], serde_json::json!([0, 1]));

    let (_, body) = send(&app, get("/api/outputs?dataset=weather&split=dev&example_idx=1")).await;
    assert_eq!(body[0]["out"], "warm");

    let req = delete("/api/outputs?dataset=weather&setup_id=sys-a");
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 2);
}

#[tokio::test]
async fn crowdsourcing_batch_and_submission() {
    let fx = fixture(Arc::new(MockClient::echo()));
    weather(&fx.ctx);
    fx.ctx.outputs.upload("weather", "dev", "sys", "cold\nwarm", 2).unwrap();
    let app = build_router(fx.ctx.clone());

    let create = serde_json::json!({
        "mode": "crowdsourcing",
        "campaign_id": "crowd",
        "config": {"examples_per_batch": 2, "annotation_span_categories": [{"name": "Error"}]},
        "data": [{"dataset": "weather", "split": "dev", "setup_id": "sys"}]
    });
    let (status, _) = send(&app, json("POST", "/api/campaigns", create)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, get("/api/campaigns/crowd/batch?annotator_id=ann-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["examples"].as_array().unwrap().len(), 2);

    let submit = serde_json::json!({
        "campaign_id": "crowd",
        "annotator_id": "ann-1",
        "annotation_set": [{
            "dataset": "weather", "split": "dev", "example_idx": 1, "setup_id": "sys",
            "annotations": [{"type": 0, "start": 0, "text": "warm", "reason": ""}]
        }]
    });
    let (status, body) = send(&app, json("POST", "/api/annotations", submit)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["submitted"], 1);

    let (_, body) = send(&app, get(WEATHER_ROME)).await;
    let annotations = body["outputs"][0]["annotations"].as_array().unwrap();
    assert_eq!(annotations.len(), 1);
    assert_eq!(annotations[0]["annotator_id"], "ann-1");
    assert_eq!(annotations[0]["annotation_span_categories"][0]["name"], "Error");
}

#[tokio::test]
async fn config_presets_round_trip() {
    let fx = fixture(Arc::new(MockClient::echo()));
    let app = build_router(fx.ctx.clone());

    let (status, _) = send(&app, json("PUT", "/api/configs/llm_gen/short", gen_config())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app, get("/api/configs/llm_gen")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["short.yaml"]["model"], "m");

    let (status, _) = send(&app, json("PUT", "/api/configs/hidden/x", serde_json::json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn login_guards_everything_but_health() {
    let hash = hash_password("hunter2").unwrap();
    let fx = fixture_with(Arc::new(MockClient::echo()), |cfg| {
        cfg.login.active = true;
        cfg.login.username = "admin".into();
        cfg.login.password_hash = hash;
    });
    let app = build_router(fx.ctx.clone());

    let (status, _) = send(&app, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);

    let resp = app.clone().oneshot(get("/api/campaigns")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(resp.headers().contains_key(header::WWW_AUTHENTICATE));

    let req = Request::builder()
        .uri("/api/campaigns")
        .header(header::AUTHORIZATION, format!("Basic {}", STANDARD.encode("admin:hunter2")))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}
