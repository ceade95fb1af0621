//! annogen: annotation and generation campaigns over datasets and model outputs.
//!
//! Campaigns live on disk under `<data_dir>/campaigns/<id>`. LLM campaigns are
//! driven by a background runner per campaign ([`orchestrator`]) that streams
//! progress through a per-campaign [`announcer`]; the HTTP layer ([`api`])
//! exposes campaigns, outputs and progress.

pub mod annotations;
pub mod announcer;
pub mod api;
pub mod auth;
pub mod backoff;
pub mod campaign;
pub mod config;
pub mod context;
pub mod datasets;
pub mod error;
pub mod events;
pub mod index;
pub mod io;
pub mod models;
pub mod orchestrator;
pub mod outputs;
pub mod providers;
pub mod rate_limit;
pub mod records;
pub mod run_control;
pub mod store;

pub use context::AppContext;
pub use error::{CampaignError, Result};
