use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use crate::campaign::CampaignMode;
use crate::error::{CampaignError, Result};
use crate::io::{is_safe_filename, write_atomic};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerCfg {
    pub announcer_capacity: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_jitter_ms: u64,
    #[serde(default)]
    pub rate_per_min: Option<u32>,
}

impl Default for RunnerCfg {
    fn default() -> Self {
        Self {
            announcer_capacity: 256,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_factor: 2.0,
            backoff_jitter_ms: 250,
            rate_per_min: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginCfg {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub username: String,
    /// argon2 PHC string
    #[serde(default)]
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub host_prefix: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub render_dir: Option<PathBuf>,
    #[serde(default)]
    pub runner: RunnerCfg,
    #[serde(default)]
    pub login: LoginCfg,
}

fn default_bind() -> String {
    "127.0.0.1:8890".into()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            host_prefix: String::new(),
            data_dir: default_data_dir(),
            render_dir: None,
            runner: RunnerCfg::default(),
            login: LoginCfg::default(),
        }
    }
}

impl AppConfig {
    /// Read the YAML config, falling back to defaults when the file is absent.
    /// `ANNOGEN_BIND` and `ANNOGEN_DATA_DIR` override the file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut cfg = if path.exists() {
            let txt = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str::<AppConfig>(&txt).context("Failed to parse config YAML")?
        } else {
            warn!(path = %path.display(), "config file not found, using defaults");
            AppConfig::default()
        };
        if let Ok(bind) = std::env::var("ANNOGEN_BIND") {
            cfg.bind = bind;
        }
        if let Ok(dir) = std::env::var("ANNOGEN_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        Ok(cfg)
    }

    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), ..Default::default() }
    }

    pub fn input_dir(&self) -> PathBuf {
        self.data_dir.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("outputs")
    }

    pub fn campaigns_dir(&self) -> PathBuf {
        self.data_dir.join("campaigns")
    }

    pub fn preset_dir(&self, mode: CampaignMode) -> Option<PathBuf> {
        match mode {
            CampaignMode::LlmEval | CampaignMode::LlmGen | CampaignMode::Crowdsourcing => {
                Some(self.data_dir.join("config").join(mode.as_str()))
            }
            CampaignMode::External | CampaignMode::Hidden => None,
        }
    }

    /// Create every directory the service writes into.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.input_dir())?;
        std::fs::create_dir_all(self.output_dir())?;
        std::fs::create_dir_all(self.campaigns_dir())?;
        for mode in [CampaignMode::LlmEval, CampaignMode::LlmGen, CampaignMode::Crowdsourcing] {
            if let Some(dir) = self.preset_dir(mode) {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

fn require_preset_dir(cfg: &AppConfig, mode: CampaignMode) -> Result<PathBuf> {
    cfg.preset_dir(mode).ok_or_else(|| {
        CampaignError::InvalidConfig(format!("mode {} has no presets", mode.as_str()))
    })
}

/// All `*.yaml` presets for a mode, keyed by file name. Unreadable files are skipped.
pub fn load_presets(
    cfg: &AppConfig,
    mode: CampaignMode,
) -> Result<BTreeMap<String, serde_json::Value>> {
    let dir = require_preset_dir(cfg, mode)?;
    let mut presets = BTreeMap::new();
    let rd = match std::fs::read_dir(&dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(presets),
        Err(e) => return Err(e.into()),
    };
    for ent in rd {
        let path = ent?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("yaml") {
            continue;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        let parsed = std::fs::read_to_string(&path).map_err(CampaignError::from).and_then(|txt| {
            serde_yaml::from_str::<serde_json::Value>(&txt).map_err(CampaignError::from)
        });
        match parsed {
            Ok(value) => {
                presets.insert(name, value);
            }
            Err(e) => error!(file = %path.display(), "error while loading preset: {e}"),
        }
    }
    Ok(presets)
}

pub fn save_preset(
    cfg: &AppConfig,
    mode: CampaignMode,
    filename: &str,
    config: &serde_json::Value,
) -> Result<PathBuf> {
    if !is_safe_filename(filename) {
        return Err(CampaignError::InvalidConfig(format!("invalid preset file name: {filename}")));
    }
    let dir = require_preset_dir(cfg, mode)?;
    let name = if filename.ends_with(".yaml") {
        filename.to_string()
    } else {
        format!("{filename}.yaml")
    };
    let path = dir.join(name);
    let txt = serde_yaml::to_string(config)?;
    write_atomic(&path, txt.as_bytes())?;
    Ok(path)
}
