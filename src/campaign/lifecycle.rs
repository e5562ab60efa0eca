use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;

use super::schedule::first_step_at;
use super::store::{Store, StoreError};
use super::types::{Campaign, CampaignStatus};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidTransition(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Drives the DRAFT → ACTIVE → PAUSED → ACTIVE → COMPLETED state machine.
/// Every transition is one store transaction; pausing never touches job
/// rows, so resuming leaves each job's original `scheduled_at` intact.
pub struct CampaignLifecycle<S: Store> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: Store> CampaignLifecycle<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Activate a DRAFT campaign and enqueue the step-1 job for every
    /// non-terminal lead. Step 1 is anchored at `start_time`, clamped to
    /// now; template delays do not apply to it.
    pub fn launch(
        &self,
        campaign_id: Uuid,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<Campaign, LifecycleError> {
        let now = self.clock.now();
        let step_one_at = first_step_at(start_time, now);
        let campaign = self.store.launch_campaign(campaign_id, step_one_at, now)?;
        info!(
            "launched campaign {} (step 1 scheduled at {})",
            campaign_id, step_one_at
        );
        Ok(campaign)
    }

    pub fn pause(&self, campaign_id: Uuid) -> Result<Campaign, LifecycleError> {
        let campaign = self.store.transition_campaign(
            campaign_id,
            CampaignStatus::Active,
            CampaignStatus::Paused,
        )?;
        info!("paused campaign {}", campaign_id);
        Ok(campaign)
    }

    /// Overdue jobs become eligible again immediately; nothing is
    /// rescheduled.
    pub fn resume(&self, campaign_id: Uuid) -> Result<Campaign, LifecycleError> {
        let campaign = self.store.transition_campaign(
            campaign_id,
            CampaignStatus::Paused,
            CampaignStatus::Active,
        )?;
        info!("resumed campaign {}", campaign_id);
        Ok(campaign)
    }

    pub fn delete(&self, campaign_id: Uuid) -> Result<(), LifecycleError> {
        self.store.delete_campaign(campaign_id)?;
        info!("deleted campaign {}", campaign_id);
        Ok(())
    }

    /// Copy the campaign and its templates (not leads or jobs) into a new
    /// DRAFT campaign.
    pub fn duplicate(
        &self,
        campaign_id: Uuid,
        name: Option<&str>,
    ) -> Result<Campaign, LifecycleError> {
        let copy = self.store.duplicate_campaign(campaign_id, name)?;
        info!("duplicated campaign {} into {}", campaign_id, copy.id);
        Ok(copy)
    }

    pub fn check_completion(&self, campaign_id: Uuid) -> Result<bool, StoreError> {
        let completed = self.store.try_complete_campaign(campaign_id)?;
        if completed {
            info!("campaign completed: {}", campaign_id);
        }
        Ok(completed)
    }
}
