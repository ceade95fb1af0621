use thiserror::Error;

use crate::providers::ProviderError;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("campaign {0} is already running")]
    AlreadyRunning(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("model error: {0}")]
    Provider(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, CampaignError>;

impl From<serde_json::Error> for CampaignError {
    fn from(err: serde_json::Error) -> Self {
        CampaignError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for CampaignError {
    fn from(err: serde_yaml::Error) -> Self {
        CampaignError::Serialization(err.to_string())
    }
}

impl CampaignError {
    /// Errors that end a whole run instead of a single example.
    pub fn is_fatal(&self) -> bool {
        match self {
            CampaignError::MissingCredentials(_) | CampaignError::InvalidConfig(_) => true,
            CampaignError::Provider(e) => e.is_fatal(),
            _ => false,
        }
    }
}
