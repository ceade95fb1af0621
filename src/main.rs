use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use annogen::config::AppConfig;
use annogen::events::RunEvent;
use annogen::orchestrator::{self, RunOutcome};
use annogen::providers::HttpClientFactory;
use annogen::{auth, AppContext};

#[derive(Parser)]
#[command(name = "annogen", version, about = "Annotation campaigns over model outputs")]
struct Cli {
    /// YAML config file
    #[arg(long, env = "ANNOGEN_CONFIG", default_value = "annogen.yml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP API
    Serve,
    /// Run one LLM campaign in the foreground. Ctrl-C pauses it.
    Run { campaign: String },
    /// Print an argon2 hash for `login.password_hash`. Reads stdin when no password is given.
    HashPassword { password: Option<String> },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("annogen=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_context(config_path: &Path) -> Result<AppContext> {
    let cfg = AppConfig::load(config_path)?;
    cfg.ensure_dirs()
        .with_context(|| format!("Failed to prepare data directory: {}", cfg.data_dir.display()))?;
    let clients = HttpClientFactory::new().context("Failed to build HTTP client")?;
    Ok(AppContext::new(cfg, Arc::new(clients)))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => {
            let ctx = build_context(&cli.config)?;
            annogen::api::serve(ctx).await
        }
        Command::Run { campaign } => {
            let ctx = build_context(&cli.config)?;
            run_foreground(ctx, &campaign).await
        }
        Command::HashPassword { password } => {
            let password = match password {
                Some(p) => p,
                None => {
                    let mut line = String::new();
                    std::io::stdin()
                        .lock()
                        .read_line(&mut line)
                        .context("Failed to read password")?;
                    line.trim_end_matches(['\r', '\n']).to_string()
                }
            };
            if password.is_empty() {
                anyhow::bail!("password must not be empty");
            }
            println!("{}", auth::hash_password(&password)?);
            Ok(())
        }
    }
}

async fn run_foreground(ctx: AppContext, campaign_id: &str) -> Result<()> {
    ctx.refresh(true)?;
    let campaign = ctx.campaign(campaign_id)?;
    let stats = campaign.data().stats();

    // subscribe before the run publishes anything
    let mut rx = ctx
        .state
        .lock()
        .announcers
        .get_or_create(campaign_id, ctx.config.runner.announcer_capacity)
        .subscribe();
    let task = orchestrator::start_run(&ctx, campaign_id)?;

    let bar = ProgressBar::new(stats.total as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg} [{bar:40}] {pos}/{len} ({eta})")?
            .progress_chars("=> "),
    );
    bar.set_message(campaign_id.to_string());
    bar.set_position(stats.finished as u64);

    let pauser = {
        let ctx = ctx.clone();
        let id = campaign_id.to_string();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ctx.pause(&id);
            }
        })
    };

    loop {
        match rx.recv().await {
            Ok(RunEvent::Progress { done, .. }) => bar.set_position(done as u64),
            Ok(RunEvent::ExampleFailed { position, error, .. }) => {
                bar.println(format!("example {position} failed: {error}"));
            }
            Ok(evt) if evt.is_terminal() => break,
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "progress display lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    pauser.abort();

    let outcome = task.handle.await.context("runner task panicked")?;
    bar.finish_and_clear();
    match outcome {
        RunOutcome::Finished { done, total } => {
            info!(campaign = campaign_id, done, total, "run finished")
        }
        RunOutcome::Paused { done, total } => {
            info!(campaign = campaign_id, done, total, "run paused")
        }
        RunOutcome::Failed(e) => anyhow::bail!("run of {campaign_id} failed: {e}"),
    }
    Ok(())
}
