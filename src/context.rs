use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::announcer::AnnouncerRegistry;
use crate::campaign::{Campaign, CampaignMode, ExampleRecord};
use crate::config::AppConfig;
use crate::datasets::DatasetRegistry;
use crate::error::{CampaignError, Result};
use crate::events::RunEvent;
use crate::index::CampaignIndex;
use crate::outputs::OutputStore;
use crate::providers::ClientFactory;
use crate::run_control::RunControlTable;
use crate::store::CampaignStore;

/// Everything guarded by the coarse lock. Never held across an `.await`.
#[derive(Default)]
pub struct SharedState {
    pub index: CampaignIndex,
    pub runs: RunControlTable,
    pub announcers: AnnouncerRegistry,
}

/// Handles shared by the HTTP layer, the CLI and every runner task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: CampaignStore,
    pub outputs: OutputStore,
    pub datasets: Arc<DatasetRegistry>,
    pub clients: Arc<dyn ClientFactory>,
    pub state: Arc<Mutex<SharedState>>,
}

impl AppContext {
    pub fn new(config: AppConfig, clients: Arc<dyn ClientFactory>) -> Self {
        let store = CampaignStore::new(config.campaigns_dir(), config.render_dir.clone());
        let outputs = OutputStore::new(config.output_dir());
        let datasets = Arc::new(DatasetRegistry::new(config.input_dir()));
        Self {
            config: Arc::new(config),
            store,
            outputs,
            datasets,
            clients,
            state: Arc::new(Mutex::new(SharedState::default())),
        }
    }

    pub fn refresh(&self, force: bool) -> Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.index.refresh(&self.store, &st.runs, force)
    }

    pub fn campaign(&self, id: &str) -> Result<Campaign> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.index.get_or_load(&self.store, &st.runs, id)
    }

    pub fn list(&self, modes: &[CampaignMode]) -> Result<Vec<Campaign>> {
        self.refresh(false)?;
        Ok(self.state.lock().index.sorted(modes))
    }

    pub fn default_id(&self, prefix: &str) -> Result<String> {
        self.refresh(false)?;
        Ok(self.state.lock().index.default_id(prefix))
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state.lock().runs.is_running(id)
    }

    /// Ask a run to stop at the next example boundary. `false` if none is live.
    pub fn pause(&self, id: &str) -> bool {
        let paused = self.state.lock().runs.request_pause(id);
        if paused {
            info!(campaign = id, "pause requested");
        }
        paused
    }

    /// Subscribe to a campaign's progress. `None` until its first run starts.
    pub fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<RunEvent>> {
        self.state.lock().announcers.get(id).map(|a| a.subscribe())
    }

    pub fn create_campaign(
        &self,
        mode: CampaignMode,
        id: &str,
        config: serde_json::Value,
        examples: Vec<ExampleRecord>,
    ) -> Result<Campaign> {
        let mut st = self.state.lock();
        if st.index.get(id).is_some() {
            return Err(CampaignError::AlreadyExists(format!("campaign {id}")));
        }
        let campaign = self.store.create(mode, id, config, examples)?;
        st.index.insert(campaign.clone());
        Ok(campaign)
    }

    /// Apply `f` to an idle campaign and persist it. Rejected while a run is live.
    pub fn modify_idle<F>(&self, id: &str, f: F) -> Result<Campaign>
    where
        F: FnOnce(&CampaignStore, &mut Campaign) -> Result<()>,
    {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.runs.is_live(id) {
            return Err(CampaignError::AlreadyRunning(id.to_string()));
        }
        let mut campaign = st.index.get_or_load(&self.store, &st.runs, id)?;
        f(&self.store, &mut campaign)?;
        st.index.insert(campaign.clone());
        Ok(campaign)
    }

    pub fn update_config(&self, id: &str, config: serde_json::Value) -> Result<Campaign> {
        self.modify_idle(id, |store, c| {
            c.data_mut().metadata.config = config;
            store.save_metadata(c.data())
        })
    }

    pub fn clear_all_outputs(&self, id: &str) -> Result<Campaign> {
        self.modify_idle(id, |store, c| store.clear_all_outputs(c))
    }

    pub fn clear_output(&self, id: &str, position: usize) -> Result<Campaign> {
        self.modify_idle(id, |store, c| store.clear_output(c, position))
    }

    pub fn duplicate(&self, id: &str, new_id: &str) -> Result<Campaign> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let source = st.index.get_or_load(&self.store, &st.runs, id)?;
        let copy = self.store.duplicate(&source, new_id)?;
        st.index.insert(copy.clone());
        Ok(copy)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut st = self.state.lock();
        if st.runs.is_live(id) {
            return Err(CampaignError::AlreadyRunning(id.to_string()));
        }
        self.store.delete(id)?;
        st.index.remove(id);
        st.announcers.remove(id);
        Ok(())
    }
}
