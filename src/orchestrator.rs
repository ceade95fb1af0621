//! Campaign runner: one tokio task per running LLM campaign.
//!
//! The task walks the campaign's unfinished examples in db order, checking its
//! cancellation token before each one. Every processed example is committed
//! (record appended, db rewritten) before its progress event goes out, so a
//! pause never loses or repeats work.

use slug::slugify;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::announcer::Announcer;
use crate::backoff::RetryPolicy;
use crate::campaign::{
    now_timestamp, Campaign, CampaignMode, CampaignStatus, ExampleRecord, ExampleStatus,
};
use crate::context::AppContext;
use crate::error::{CampaignError, Result};
use crate::events::RunEvent;
use crate::io::JsonlWriter;
use crate::models::{LlmModel, ModelOutput};
use crate::providers::{CompletionRequest, ProviderError};
use crate::rate_limit::SimpleRateLimiter;
use crate::records::{AnnotationRecord, GenerationRecord, OutputRecord};
use crate::run_control::RunHandle;

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Finished { done: usize, total: usize },
    Paused { done: usize, total: usize },
    Failed(String),
}

pub struct RunTask {
    pub run_id: String,
    pub handle: JoinHandle<RunOutcome>,
}

/// Validate, register and spawn a run. Configuration and credential problems
/// are reported here, before any state changes.
pub fn start_run(ctx: &AppContext, campaign_id: &str) -> Result<RunTask> {
    let campaign = ctx.campaign(campaign_id)?;
    if !campaign.mode().is_llm() {
        return Err(CampaignError::InvalidState(format!(
            "campaigns in mode {} are not run by a model",
            campaign.mode().as_str()
        )));
    }
    let model =
        LlmModel::from_config(&campaign.metadata().config, campaign.mode(), ctx.clients.as_ref())?;

    let (campaign, handle, announcer) = {
        let mut guard = ctx.state.lock();
        let st = &mut *guard;
        let handle = st.runs.register(campaign_id)?;
        let mut campaign = match st.index.get_or_load(&ctx.store, &st.runs, campaign_id) {
            Ok(c) => c,
            Err(e) => {
                st.runs.release(campaign_id, &handle.run_id);
                return Err(e);
            }
        };
        campaign.data_mut().metadata.status = CampaignStatus::Running;
        campaign.data_mut().metadata.last_error = None;
        if let Err(e) = ctx.store.save_metadata(campaign.data()) {
            st.runs.release(campaign_id, &handle.run_id);
            return Err(e);
        }
        st.index.insert(campaign.clone());
        let announcer =
            st.announcers.get_or_create(campaign_id, ctx.config.runner.announcer_capacity);
        (campaign, handle, announcer)
    };

    let stats = campaign.data().stats();
    info!(
        campaign = campaign_id,
        run_id = %handle.run_id,
        total = stats.total,
        done = stats.finished,
        "run started"
    );
    announcer.publish(RunEvent::Started {
        campaign_id: campaign_id.to_string(),
        run_id: handle.run_id.clone(),
        total: stats.total,
        done: stats.finished,
    });

    let run_id = handle.run_id.clone();
    let runner = Runner {
        ctx: ctx.clone(),
        campaign,
        model,
        handle,
        announcer,
        writers: HashMap::new(),
    };
    Ok(RunTask { run_id, handle: tokio::spawn(runner.drive()) })
}

struct Runner {
    ctx: AppContext,
    campaign: Campaign,
    model: LlmModel,
    handle: RunHandle,
    announcer: Announcer,
    writers: HashMap<PathBuf, JsonlWriter>,
}

/// A committed-to-be record and where it goes.
struct Produced {
    file: PathBuf,
    record: serde_json::Value,
    payload: serde_json::Value,
}

impl Runner {
    async fn drive(mut self) -> RunOutcome {
        let id = self.campaign.id().to_string();
        let outcome = match self.process_all().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(campaign = %id, "run failed: {e}");
                RunOutcome::Failed(e.to_string())
            }
        };

        let event = {
            let meta = &mut self.campaign.data_mut().metadata;
            match &outcome {
                RunOutcome::Finished { done, total } => {
                    if done == total {
                        meta.status = CampaignStatus::Finished;
                        meta.last_run = Some(now_timestamp());
                    } else {
                        meta.status = CampaignStatus::Idle;
                        meta.last_error = Some(format!("{} example(s) failed", total - done));
                    }
                    RunEvent::Finished { campaign_id: id.clone(), done: *done, total: *total }
                }
                RunOutcome::Paused { done, total } => {
                    meta.status = CampaignStatus::Idle;
                    RunEvent::Paused { campaign_id: id.clone(), done: *done, total: *total }
                }
                RunOutcome::Failed(msg) => {
                    meta.status = CampaignStatus::Idle;
                    meta.last_error = Some(msg.clone());
                    RunEvent::Failed { campaign_id: id.clone(), error: msg.clone() }
                }
            }
        };

        {
            let mut st = self.ctx.state.lock();
            match self.ctx.store.save_metadata(self.campaign.data()) {
                Ok(()) => st.index.insert(self.campaign.clone()),
                Err(e) => {
                    // Disk still says `running`; the next load resets it.
                    error!(campaign = %id, "cannot persist final status: {e}");
                    st.index.remove(&id);
                }
            }
            st.runs.release(&id, &self.handle.run_id);
        }
        info!(campaign = %id, outcome = event.event_type(), "run ended");
        self.announcer.publish(event);
        outcome
    }

    async fn process_all(&mut self) -> Result<RunOutcome> {
        let policy = RetryPolicy::from_cfg(&self.ctx.config.runner);
        let limiter = SimpleRateLimiter::optional(self.ctx.config.runner.rate_per_min);
        let id = self.campaign.id().to_string();
        let total = self.campaign.data().examples.len();

        for position in self.campaign.data().pending_positions() {
            if self.handle.token.is_cancelled() {
                let done = self.campaign.data().stats().finished;
                info!(campaign = %id, done, total, "run paused");
                return Ok(RunOutcome::Paused { done, total });
            }
            if let Some(limiter) = &limiter {
                limiter.wait().await;
            }
            let example = self.campaign.data().examples[position].clone();
            match self.process_example(&example, &policy).await {
                Ok(produced) => self.commit(position, &example, produced).await?,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        campaign = %id,
                        position,
                        dataset = %example.dataset,
                        split = %example.split,
                        example_idx = example.example_idx,
                        "example failed: {e}"
                    );
                    self.announcer.publish(RunEvent::ExampleFailed {
                        campaign_id: id.clone(),
                        position,
                        error: e.to_string(),
                    });
                }
            }
        }
        let done = self.campaign.data().stats().finished;
        Ok(RunOutcome::Finished { done, total })
    }

    async fn process_example(
        &self,
        example: &ExampleRecord,
        policy: &RetryPolicy,
    ) -> Result<Produced> {
        let dataset = self.ctx.datasets.get(&example.dataset)?;
        let data = dataset.get_example(&example.split, example.example_idx)?;
        let files = self.campaign.data().files_dir();

        match self.campaign.mode() {
            CampaignMode::LlmEval => {
                let setup_id = example.setup_id.clone().ok_or_else(|| {
                    let msg = format!("example {} has no setup_id", example.example_idx);
                    CampaignError::InvalidState(msg)
                })?;
                let text = self
                    .ctx
                    .outputs
                    .get(&example.dataset, &example.split, &setup_id, example.example_idx)
                    .and_then(|o| o.out)
                    .ok_or_else(|| {
                        CampaignError::NotFound(format!(
                            "output {}/{}/{setup_id}/{}",
                            example.dataset, example.split, example.example_idx
                        ))
                    })?;
                let (prompt, req) = self.model.request_for(data, Some(&text))?;
                let response = call_with_retry(&self.model, &req, policy).await?;
                let ModelOutput::Annotations(annotations) =
                    self.model.interpret(&response, Some(&text))
                else {
                    let msg = "evaluation produced no annotations".to_string();
                    return Err(CampaignError::InvalidState(msg));
                };
                let annotator_id = self.model.annotator_id();
                let record = AnnotationRecord {
                    annotator_id: annotator_id.clone(),
                    annotator_group: 0,
                    campaign_id: self.campaign.id().to_string(),
                    dataset: example.dataset.clone(),
                    split: example.split.clone(),
                    example_idx: example.example_idx,
                    setup_id,
                    annotations: annotations.clone(),
                    flags: Vec::new(),
                    options: Vec::new(),
                    text_fields: Vec::new(),
                    metadata: Some(serde_json::json!({ "prompt": prompt, "response": response })),
                };
                Ok(Produced {
                    file: files.join(format!("{}.jsonl", slugify(&annotator_id))),
                    record: serde_json::to_value(&record)?,
                    payload: ModelOutput::Annotations(annotations).to_json(),
                })
            }
            _ => {
                let (prompt, req) = self.model.request_for(data, None)?;
                let response = call_with_retry(&self.model, &req, policy).await?;
                let output = self.model.interpret(&response, None);
                let text = match &output {
                    ModelOutput::Text(t) => t.clone(),
                    ModelOutput::Annotations(_) => response.clone(),
                };
                let record = GenerationRecord {
                    output: OutputRecord {
                        dataset: example.dataset.clone(),
                        split: example.split.clone(),
                        setup_id: self.campaign.id().to_string(),
                        example_idx: example.example_idx,
                        out: Some(text),
                    },
                    metadata: Some(serde_json::json!({ "prompt": prompt })),
                };
                Ok(Produced {
                    file: files.join(format!(
                        "{}-{}.jsonl",
                        slugify(&example.dataset),
                        slugify(&example.split)
                    )),
                    record: serde_json::to_value(&record)?,
                    payload: output.to_json(),
                })
            }
        }
    }

    /// Append the record, mark the example finished, persist, then announce.
    async fn commit(
        &mut self,
        position: usize,
        example: &ExampleRecord,
        produced: Produced,
    ) -> Result<()> {
        let writer = match self.writers.get(&produced.file) {
            Some(w) => w.clone(),
            None => {
                let w = JsonlWriter::open(produced.file.clone()).await?;
                self.writers.insert(produced.file.clone(), w.clone());
                w
            }
        };
        writer.append(&produced.record).await?;

        {
            let row = &mut self.campaign.data_mut().examples[position];
            row.status = ExampleStatus::Finished;
            row.annotator_id = Some(self.model.annotator_id());
            row.start = Some(now_timestamp());
        }
        {
            let mut st = self.ctx.state.lock();
            self.ctx.store.save_db(self.campaign.data())?;
            st.index.insert(self.campaign.clone());
        }

        let stats = self.campaign.data().stats();
        self.announcer.publish(RunEvent::Progress {
            campaign_id: self.campaign.id().to_string(),
            position,
            dataset: example.dataset.clone(),
            split: example.split.clone(),
            example_idx: example.example_idx,
            setup_id: example.setup_id.clone(),
            done: stats.finished,
            total: stats.total,
            payload: produced.payload,
        });
        Ok(())
    }
}

/// Rate-limited calls are retried with backoff; anything else is returned as is.
async fn call_with_retry(
    model: &LlmModel,
    req: &CompletionRequest,
    policy: &RetryPolicy,
) -> Result<String> {
    let mut attempt = 1;
    loop {
        match model.client().complete(req).await {
            Ok(text) => return Ok(text),
            Err(ProviderError::RateLimited) if attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    client = model.client().name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
