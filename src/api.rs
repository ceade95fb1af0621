use std::collections::BTreeMap;
use std::convert::Infallible;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use slug::slugify;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::annotations::{self, IndexedAnnotation};
use crate::auth;
use crate::campaign::{Campaign, CampaignMode, CampaignStats, CampaignStatus, ExampleRecord};
use crate::config::{load_presets, save_preset};
use crate::context::AppContext;
use crate::datasets::DatasetOverview;
use crate::error::CampaignError;
use crate::models::LlmConfig;
use crate::orchestrator;
use crate::outputs::OutputGroup;
use crate::records::AnnotationRecord;

const ALL_MODES: [CampaignMode; 5] = [
    CampaignMode::Crowdsourcing,
    CampaignMode::LlmEval,
    CampaignMode::LlmGen,
    CampaignMode::External,
    CampaignMode::Hidden,
];

pub fn build_router(ctx: AppContext) -> Router {
    let api = Router::new()
        .route("/api/campaigns", get(list_campaigns).post(create_campaign))
        .route("/api/campaigns/{id}", get(get_campaign).delete(delete_campaign))
        .route("/api/campaigns/{id}/config", put(update_config))
        .route("/api/campaigns/{id}/run", post(run_campaign))
        .route("/api/campaigns/{id}/pause", post(pause_campaign))
        .route("/api/campaigns/{id}/progress", get(campaign_progress))
        .route("/api/campaigns/{id}/duplicate", post(duplicate_campaign))
        .route("/api/campaigns/{id}/clear", post(clear_campaign))
        .route("/api/campaigns/{id}/clear/{position}", post(clear_example))
        .route("/api/campaigns/{id}/save-outputs", post(save_outputs))
        .route("/api/campaigns/{id}/batch", get(assign_batch))
        .route("/api/annotations", post(submit_annotations))
        .route("/api/outputs", get(list_outputs).post(upload_outputs).delete(delete_outputs))
        .route("/api/example", get(get_example))
        .route("/api/datasets", get(list_datasets))
        .route("/api/configs/{mode}", get(list_configs))
        .route("/api/configs/{mode}/{filename}", put(save_config))
        .nest_service("/files", ServeDir::new(ctx.config.input_dir()))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), auth::require_login))
        .route("/api/health", get(health))
        .with_state(ctx.clone());

    let prefix = ctx.config.host_prefix.trim_matches('/');
    let app = if prefix.is_empty() { api } else { Router::new().nest(&format!("/{prefix}"), api) };

    app.layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive())
}

pub async fn serve(ctx: AppContext) -> Result<()> {
    let bind = ctx.config.bind.clone();
    ctx.refresh(true).context("Failed to scan campaigns")?;
    let app = build_router(ctx.clone());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!("annogen API listening on http://{bind}");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(ctx)).await?;
    Ok(())
}

/// On Ctrl-C, ask every live run to stop at its next example boundary.
async fn shutdown_signal(ctx: AppContext) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    let active = ctx.state.lock().runs.active_ids();
    for id in &active {
        ctx.pause(id);
    }
    info!(paused = active.len(), "shutting down");
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[derive(Serialize)]
struct CampaignSummary {
    id: String,
    mode: CampaignMode,
    status: CampaignStatus,
    created: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    stats: CampaignStats,
    running: bool,
}

impl CampaignSummary {
    fn new(c: &Campaign, running: bool) -> Self {
        let meta = c.metadata();
        Self {
            id: meta.id.clone(),
            mode: meta.mode,
            status: meta.status,
            created: meta.created.clone(),
            last_run: meta.last_run.clone(),
            last_error: meta.last_error.clone(),
            stats: c.data().stats(),
            running,
        }
    }
}

#[derive(Serialize)]
struct CampaignDetail {
    #[serde(flatten)]
    summary: CampaignSummary,
    config: serde_json::Value,
    examples: Vec<ExampleRecord>,
}

fn summary(ctx: &AppContext, c: &Campaign) -> CampaignSummary {
    CampaignSummary::new(c, ctx.is_running(c.id()))
}

fn parse_mode(raw: &str) -> Result<CampaignMode, ApiErr> {
    CampaignMode::parse(raw)
        .ok_or_else(|| ApiErr::bad_request(format!("unknown campaign mode: {raw}")))
}

#[derive(Deserialize)]
struct ModeQuery {
    mode: Option<String>,
}

async fn list_campaigns(
    State(ctx): State<AppContext>,
    Query(q): Query<ModeQuery>,
) -> Result<Json<Vec<CampaignSummary>>, ApiErr> {
    let modes = match q.mode.as_deref() {
        Some(m) => vec![parse_mode(m)?],
        None => ALL_MODES.to_vec(),
    };
    let list = ctx.list(&modes)?;
    Ok(Json(list.iter().map(|c| summary(&ctx, c)).collect()))
}

async fn get_campaign(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<CampaignDetail>, ApiErr> {
    let c = ctx.campaign(&id)?;
    Ok(Json(CampaignDetail {
        summary: summary(&ctx, &c),
        config: c.metadata().config.clone(),
        examples: c.data().examples.clone(),
    }))
}

async fn delete_campaign(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiErr> {
    ctx.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct DataSelection {
    dataset: String,
    split: String,
    #[serde(default)]
    setup_id: Option<String>,
}

#[derive(Deserialize)]
struct CreateCampaignReq {
    mode: CampaignMode,
    #[serde(default)]
    campaign_id: Option<String>,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default)]
    data: Vec<DataSelection>,
}

fn validate_config(mode: CampaignMode, config: &serde_json::Value) -> Result<(), ApiErr> {
    if mode.is_llm() {
        LlmConfig::parse(config, mode)?;
    }
    Ok(())
}

/// One db row per selected example. Generation campaigns take every example
/// of a split; the other modes take the outputs stored for a setup.
fn build_examples(
    ctx: &AppContext,
    mode: CampaignMode,
    config: &serde_json::Value,
    data: &[DataSelection],
) -> Result<Vec<ExampleRecord>, ApiErr> {
    let mut examples = Vec::new();
    for sel in data {
        if mode == CampaignMode::LlmGen {
            let ds = ctx.datasets.get(&sel.dataset)?;
            let count = ds.example_count(&sel.split);
            if count == 0 {
                return Err(ApiErr::bad_request(format!(
                    "split {} of {} has no examples",
                    sel.split, sel.dataset
                )));
            }
            examples
                .extend((0..count).map(|i| ExampleRecord::new(&sel.dataset, &sel.split, i, None)));
        } else {
            let setup_id = sel.setup_id.as_deref().ok_or_else(|| {
                ApiErr::bad_request(format!("setup_id is required for {} campaigns", mode.as_str()))
            })?;
            let setup_id = slugify(setup_id);
            let ids = ctx.outputs.example_ids(&sel.dataset, &sel.split, &setup_id);
            if ids.is_empty() {
                return Err(ApiErr::bad_request(format!(
                    "no outputs for {}/{}/{setup_id}",
                    sel.dataset, sel.split
                )));
            }
            examples.extend(
                ids.into_iter()
                    .map(|i| ExampleRecord::new(&sel.dataset, &sel.split, i, Some(&setup_id))),
            );
        }
    }
    let per_batch = match mode {
        CampaignMode::Crowdsourcing => {
            config.get("examples_per_batch").and_then(|v| v.as_u64()).unwrap_or(1).max(1) as usize
        }
        _ => 1,
    };
    for (i, ex) in examples.iter_mut().enumerate() {
        ex.batch_idx = i / per_batch;
    }
    Ok(examples)
}

async fn create_campaign(
    State(ctx): State<AppContext>,
    Json(req): Json<CreateCampaignReq>,
) -> Result<(StatusCode, Json<CampaignSummary>), ApiErr> {
    let id = match req.campaign_id.as_deref().map(slugify) {
        Some(id) if !id.is_empty() => id,
        Some(_) => return Err(ApiErr::bad_request("campaign_id must contain letters or digits")),
        None => ctx.default_id(&slugify(req.mode.as_str()))?,
    };
    validate_config(req.mode, &req.config)?;
    let examples = build_examples(&ctx, req.mode, &req.config, &req.data)?;
    let campaign = ctx.create_campaign(req.mode, &id, req.config, examples)?;
    Ok((StatusCode::CREATED, Json(summary(&ctx, &campaign))))
}

async fn update_config(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(config): Json<serde_json::Value>,
) -> Result<Json<CampaignSummary>, ApiErr> {
    let mode = ctx.campaign(&id)?.mode();
    validate_config(mode, &config)?;
    let c = ctx.update_config(&id, config)?;
    Ok(Json(summary(&ctx, &c)))
}

#[derive(Serialize)]
struct RunStarted {
    campaign_id: String,
    run_id: String,
}

async fn run_campaign(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RunStarted>), ApiErr> {
    let task = orchestrator::start_run(&ctx, &id)?;
    Ok((StatusCode::ACCEPTED, Json(RunStarted { campaign_id: id, run_id: task.run_id })))
}

async fn pause_campaign(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let paused = ctx.pause(&id);
    Json(serde_json::json!({ "campaign_id": id, "paused": paused }))
}

async fn campaign_progress(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiErr> {
    let rx = ctx
        .subscribe(&id)
        .ok_or_else(|| ApiErr::not_found(format!("no progress announcer for campaign {id}")))?;

    let stream = BroadcastStream::new(rx)
        .filter_map(move |msg| {
            let evt = match msg {
                Ok(evt) => Some(evt),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(campaign = %id, skipped, "progress subscriber lagged");
                    None
                }
            };
            futures_util::future::ready(evt)
        })
        .map(|evt| {
            let event = match serde_json::to_string(&evt) {
                Ok(json) => Event::default().event(evt.event_type()).data(json),
                Err(e) => Event::default().event("error").data(e.to_string()),
            };
            Ok(event)
        });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
struct DuplicateReq {
    new_id: String,
}

async fn duplicate_campaign(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(req): Json<DuplicateReq>,
) -> Result<(StatusCode, Json<CampaignSummary>), ApiErr> {
    let new_id = slugify(&req.new_id);
    if new_id.is_empty() {
        return Err(ApiErr::bad_request("new_id must contain letters or digits"));
    }
    let c = ctx.duplicate(&id, &new_id)?;
    Ok((StatusCode::CREATED, Json(summary(&ctx, &c))))
}

async fn clear_campaign(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<CampaignSummary>, ApiErr> {
    let c = ctx.clear_all_outputs(&id)?;
    Ok(Json(summary(&ctx, &c)))
}

async fn clear_example(
    State(ctx): State<AppContext>,
    Path((id, position)): Path<(String, usize)>,
) -> Result<Json<CampaignSummary>, ApiErr> {
    let c = ctx.clear_output(&id, position)?;
    Ok(Json(summary(&ctx, &c)))
}

#[derive(Deserialize)]
struct SaveOutputsReq {
    model_name: String,
}

async fn save_outputs(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(req): Json<SaveOutputsReq>,
) -> Result<Json<serde_json::Value>, ApiErr> {
    let c = ctx.campaign(&id)?;
    let saved = ctx.outputs.save_generation_outputs(&c, &req.model_name)?;
    Ok(Json(serde_json::json!({ "saved": saved, "setup_id": slugify(&req.model_name) })))
}

#[derive(Deserialize)]
struct BatchQuery {
    annotator_id: String,
}

async fn assign_batch(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Query(q): Query<BatchQuery>,
) -> Result<Json<serde_json::Value>, ApiErr> {
    let mut assigned = Vec::new();
    ctx.modify_idle(&id, |store, c| {
        assigned = annotations::assign_batch(store, c, &q.annotator_id)?;
        Ok(())
    })?;
    Ok(Json(serde_json::json!({
        "campaign_id": id,
        "annotator_id": q.annotator_id,
        "examples": assigned
    })))
}

#[derive(Deserialize)]
struct SubmitReq {
    campaign_id: String,
    annotator_id: String,
    annotation_set: Vec<AnnotationRecord>,
}

async fn submit_annotations(
    State(ctx): State<AppContext>,
    Json(req): Json<SubmitReq>,
) -> Result<Json<serde_json::Value>, ApiErr> {
    let mut submitted = 0;
    let records = req.annotation_set;
    ctx.modify_idle(&req.campaign_id, |store, c| {
        submitted = annotations::submit(store, c, &req.annotator_id, records)?;
        Ok(())
    })?;
    Ok(Json(serde_json::json!({ "submitted": submitted })))
}

#[derive(Deserialize)]
struct OutputsQuery {
    dataset: Option<String>,
    split: Option<String>,
    setup_id: Option<String>,
    example_idx: Option<usize>,
}

async fn list_outputs(
    State(ctx): State<AppContext>,
    Query(q): Query<OutputsQuery>,
) -> Result<Json<serde_json::Value>, ApiErr> {
    if let (Some(dataset), Some(split), Some(idx)) = (&q.dataset, &q.split, q.example_idx) {
        let mut outputs = ctx.outputs.for_example(dataset, split, idx);
        if let Some(setup) = &q.setup_id {
            let setup = slugify(setup);
            outputs.retain(|o| o.setup_id == setup);
        }
        return Ok(Json(serde_json::to_value(outputs).map_err(ApiErr::internal)?));
    }
    let datasets: Vec<String> = q.dataset.iter().map(|d| slugify(d)).collect();
    let groups: Vec<OutputGroup> = ctx.outputs.overview(&datasets, false);
    Ok(Json(serde_json::to_value(groups).map_err(ApiErr::internal)?))
}

#[derive(Deserialize)]
struct UploadOutputsReq {
    dataset: String,
    split: String,
    setup_id: String,
    outputs: String,
}

async fn upload_outputs(
    State(ctx): State<AppContext>,
    Json(req): Json<UploadOutputsReq>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiErr> {
    let expected = ctx.datasets.get(&req.dataset)?.example_count(&req.split);
    let count =
        ctx.outputs.upload(&req.dataset, &req.split, &req.setup_id, &req.outputs, expected)?;
    let body = serde_json::json!({ "count": count, "setup_id": slugify(&req.setup_id) });
    Ok((StatusCode::CREATED, Json(body)))
}

#[derive(Deserialize)]
struct DeleteOutputsQuery {
    dataset: String,
    split: Option<String>,
    setup_id: Option<String>,
}

async fn delete_outputs(
    State(ctx): State<AppContext>,
    Query(q): Query<DeleteOutputsQuery>,
) -> Result<Json<serde_json::Value>, ApiErr> {
    let removed = ctx.outputs.delete(
        &slugify(&q.dataset),
        q.split.as_deref().map(slugify).as_deref(),
        q.setup_id.as_deref().map(slugify).as_deref(),
    )?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

#[derive(Deserialize)]
struct ExampleQuery {
    dataset: String,
    split: String,
    example_idx: usize,
}

#[derive(Serialize)]
struct ExampleOutput {
    setup_id: String,
    out: Option<String>,
    annotations: Vec<IndexedAnnotation>,
}

async fn get_example(
    State(ctx): State<AppContext>,
    Query(q): Query<ExampleQuery>,
) -> Result<Json<serde_json::Value>, ApiErr> {
    let ds = ctx.datasets.get(&q.dataset)?;
    let data = ds.get_example(&q.split, q.example_idx)?.clone();
    let campaigns = ctx.list(&ALL_MODES)?;
    let outputs: Vec<ExampleOutput> = ctx
        .outputs
        .for_example(&q.dataset, &q.split, q.example_idx)
        .into_iter()
        .map(|o| ExampleOutput {
            annotations: annotations::for_output(
                &campaigns,
                &q.dataset,
                &q.split,
                q.example_idx,
                &o.setup_id,
            ),
            setup_id: o.setup_id,
            out: o.out,
        })
        .collect();
    Ok(Json(serde_json::json!({
        "dataset": q.dataset,
        "split": q.split,
        "example_idx": q.example_idx,
        "total_examples": ds.example_count(&q.split),
        "data": data,
        "outputs": outputs,
    })))
}

async fn list_datasets(State(ctx): State<AppContext>) -> Json<Vec<DatasetOverview>> {
    Json(ctx.datasets.overview())
}

async fn list_configs(
    State(ctx): State<AppContext>,
    Path(mode): Path<String>,
) -> Result<Json<BTreeMap<String, serde_json::Value>>, ApiErr> {
    let mode = parse_mode(&mode)?;
    Ok(Json(load_presets(&ctx.config, mode)?))
}

async fn save_config(
    State(ctx): State<AppContext>,
    Path((mode, filename)): Path<(String, String)>,
    Json(config): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiErr> {
    let mode = parse_mode(&mode)?;
    validate_config(mode, &config)?;
    let path = save_preset(&ctx.config, mode, &filename, &config)?;
    info!(mode = mode.as_str(), path = %path.display(), "config preset saved");
    let saved = path.file_name().map(|n| n.to_string_lossy().to_string());
    Ok(Json(serde_json::json!({ "saved": saved })))
}

#[derive(Debug)]
pub struct ApiErr {
    status: StatusCode,
    code: String,
    message: String,
    suggestion: Option<String>,
}

impl ApiErr {
    fn internal(e: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error".to_string(),
            message: format!("Internal error: {}", e),
            suggestion: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request".to_string(),
            message: message.into(),
            suggestion: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found".to_string(),
            message: message.into(),
            suggestion: None,
        }
    }

    fn with(status: StatusCode, code: &str, message: String, suggestion: Option<&str>) -> Self {
        Self { status, code: code.to_string(), message, suggestion: suggestion.map(str::to_string) }
    }
}

impl From<CampaignError> for ApiErr {
    fn from(e: CampaignError) -> Self {
        let message = e.to_string();
        match e {
            CampaignError::NotFound(_) => Self::not_found(message),
            CampaignError::AlreadyExists(_) => {
                Self::with(StatusCode::CONFLICT, "already_exists", message, None)
            }
            CampaignError::AlreadyRunning(_) => Self::with(
                StatusCode::CONFLICT,
                "campaign_running",
                message,
                Some("Pause the campaign and wait for the run to stop."),
            ),
            CampaignError::InvalidConfig(_) => {
                Self::with(StatusCode::BAD_REQUEST, "invalid_config", message, None)
            }
            CampaignError::MissingCredentials(_) => Self::with(
                StatusCode::BAD_REQUEST,
                "missing_credentials",
                message,
                Some("Set the API key in the environment or the .env file."),
            ),
            CampaignError::InvalidState(_) => {
                Self::with(StatusCode::BAD_REQUEST, "invalid_state", message, None)
            }
            CampaignError::Provider(_) => {
                Self::with(StatusCode::BAD_GATEWAY, "model_error", message, None)
            }
            CampaignError::Io(_) | CampaignError::Serialization(_) => Self::internal(message),
        }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> axum::response::Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            suggestion: Option<String>,
        }
        if self.status.is_server_error() {
            warn!(code = %self.code, "{}", self.message);
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code,
                suggestion: self.suggestion,
            }),
        )
            .into_response()
    }
}
