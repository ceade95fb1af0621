use std::collections::{HashMap, HashSet};
use tracing::{error, info};

use crate::campaign::{Campaign, CampaignMode, CampaignStatus};
use crate::error::Result;
use crate::run_control::RunControlTable;
use crate::store::CampaignStore;

/// In-memory cache of campaigns. The store on disk stays the source of truth.
#[derive(Default)]
pub struct CampaignIndex {
    campaigns: HashMap<String, Campaign>,
}

impl CampaignIndex {
    /// Rescan the campaigns root. Existing entries are re-read only when `force` is set.
    pub fn refresh(
        &mut self,
        store: &CampaignStore,
        runs: &RunControlTable,
        force: bool,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        for id in store.list_ids()? {
            seen.insert(id.clone());
            if !force && self.campaigns.contains_key(&id) {
                continue;
            }
            match load_checked(store, runs, &id) {
                Ok(campaign) => {
                    self.campaigns.insert(id, campaign);
                }
                Err(e) => error!(campaign = %id, "error while loading campaign: {e}"),
            }
        }
        self.campaigns.retain(|id, _| seen.contains(id));
        Ok(())
    }

    /// Cached campaign, loading it from disk on a miss.
    pub fn get_or_load(
        &mut self,
        store: &CampaignStore,
        runs: &RunControlTable,
        id: &str,
    ) -> Result<Campaign> {
        if let Some(c) = self.campaigns.get(id) {
            return Ok(c.clone());
        }
        let campaign = load_checked(store, runs, id)?;
        self.campaigns.insert(id.to_string(), campaign.clone());
        Ok(campaign)
    }

    pub fn get(&self, id: &str) -> Option<&Campaign> {
        self.campaigns.get(id)
    }

    pub fn insert(&mut self, campaign: Campaign) {
        self.campaigns.insert(campaign.id().to_string(), campaign);
    }

    pub fn remove(&mut self, id: &str) -> Option<Campaign> {
        self.campaigns.remove(id)
    }

    pub fn len(&self) -> usize {
        self.campaigns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.campaigns.is_empty()
    }

    /// Campaigns of the given modes, newest first.
    pub fn sorted(&self, modes: &[CampaignMode]) -> Vec<Campaign> {
        let mut list: Vec<Campaign> =
            self.campaigns.values().filter(|c| modes.contains(&c.mode())).cloned().collect();
        list.sort_by(|a, b| {
            b.metadata().created.cmp(&a.metadata().created).then_with(|| a.id().cmp(b.id()))
        });
        list
    }

    /// First `prefix-N` (N from 1) not taken by any campaign.
    pub fn default_id(&self, prefix: &str) -> String {
        (1..)
            .map(|i| format!("{prefix}-{i}"))
            .find(|id| !self.campaigns.contains_key(id))
            .unwrap_or_else(|| prefix.to_string())
    }
}

/// Load a campaign and reset a stale `running` status left behind by a dead process.
pub fn load_checked(store: &CampaignStore, runs: &RunControlTable, id: &str) -> Result<Campaign> {
    let mut campaign = store.load(id)?;
    if campaign.status() == CampaignStatus::Running && !runs.is_live(id) {
        info!(campaign = id, "resetting stale running status to idle");
        campaign.data_mut().metadata.status = CampaignStatus::Idle;
        store.save_metadata(campaign.data())?;
    }
    Ok(campaign)
}
