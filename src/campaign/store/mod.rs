use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::lifecycle::LifecycleError;
use super::types::{
    Campaign, CampaignStatus, Job, JobStatus, Lead, LeadStatus, Template, User,
};

pub mod memory;
pub mod pg;
mod schema;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("store config error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Next follow-up to enqueue inside the same transaction that records a
/// successful send.
#[derive(Debug, Clone, Copy)]
pub struct NextStep {
    pub step_number: i32,
    pub scheduled_at: DateTime<Utc>,
}

/// Outcome of recording an inbound reply for a lead.
#[derive(Debug)]
pub enum ReplyRecord {
    NotFound,
    AlreadyTerminal(Lead),
    Replied { lead: Lead, canceled_jobs: u64 },
}

/// Outcome of recording a bounce for a sent message.
#[derive(Debug)]
pub enum BounceRecord {
    NoMatch,
    Recorded { job: Job, lead_failed: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailHistoryEntry {
    pub step_number: i32,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub subject: Option<String>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub step_number: i32,
    pub sent: i64,
    pub pending: i64,
    pub failed: i64,
    pub skipped: i64,
    pub next_scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignStats {
    pub campaign: Campaign,
    pub total_leads: i64,
    pub pending_leads: i64,
    pub contacted_leads: i64,
    pub replied_leads: i64,
    pub failed_leads: i64,
    pub pending_jobs: i64,
}

/// A PENDING job reserved by one worker. The row lock (or its in-memory
/// equivalent) is held for the lifetime of the claim; the `commit_*` methods
/// consume the claim and end the transaction, and dropping an uncommitted
/// claim rolls back, returning the job to PENDING.
pub trait ClaimedJob {
    fn job(&self) -> &Job;

    /// Re-read under the lock. These back the final pre-send validation.
    fn campaign(&mut self) -> Result<Option<Campaign>, StoreError>;
    fn lead(&mut self) -> Result<Option<Lead>, StoreError>;
    fn owner(&mut self) -> Result<Option<User>, StoreError>;
    fn template_for_step(&mut self, step_number: i32) -> Result<Option<Template>, StoreError>;

    /// Roll back without touching the row. Used when the campaign is not
    /// active: the job stays PENDING and is re-checked next tick.
    fn release(self) -> Result<(), StoreError>;

    /// Skip without counting an attempt.
    fn commit_skipped(self, reason: &str) -> Result<(), StoreError>;

    /// Record a successful send, advance the lead PENDING→CONTACTED, and
    /// enqueue the next step if there is one. One transaction.
    fn commit_sent(
        self,
        sent_at: DateTime<Utc>,
        message_id: &str,
        next: Option<NextStep>,
    ) -> Result<(), StoreError>;

    /// Count the attempt and push `scheduled_at` to `next_at`.
    fn commit_retry(self, next_at: DateTime<Utc>, error: &str) -> Result<(), StoreError>;

    /// Count the attempt and fail the job. The lead is failed too, unless
    /// another job for it has already been sent.
    fn commit_failed(self, error: &str) -> Result<(), StoreError>;
}

/// Transactional persistence for campaigns, leads, templates, and jobs.
/// Every method is a single atomic operation; multi-row mutations happen in
/// one transaction inside the implementation.
pub trait Store: Send + Sync + 'static {
    type Claim: ClaimedJob;

    /// Snapshot of due PENDING job ids in dispatch order
    /// (`scheduled_at, campaign_id, lead_id, step_number`). No locks taken.
    fn due_job_ids(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError>;

    /// Lock a single due job with skip-locked semantics. `None` means the
    /// row is gone, no longer due, or claimed by another worker.
    fn claim_job(&self, job_id: Uuid, now: DateTime<Utc>)
        -> Result<Option<Self::Claim>, StoreError>;

    /// Idempotent on (lead, step): when a PENDING or SENT job already
    /// exists for the pair, it is returned unchanged.
    fn create_job(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
        step_number: i32,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    fn cancel_pending_jobs_for_lead(&self, lead_id: Uuid, reason: &str)
        -> Result<u64, StoreError>;

    fn load_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError>;
    fn load_lead(&self, id: Uuid) -> Result<Option<Lead>, StoreError>;
    fn load_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    fn load_template(
        &self,
        campaign_id: Uuid,
        step_number: i32,
    ) -> Result<Option<Template>, StoreError>;
    fn load_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    fn templates_for_campaign(&self, campaign_id: Uuid) -> Result<Vec<Template>, StoreError>;
    fn leads_for_campaign(
        &self,
        campaign_id: Uuid,
        status: Option<LeadStatus>,
    ) -> Result<Vec<Lead>, StoreError>;
    fn jobs_for_lead(&self, lead_id: Uuid) -> Result<Vec<Job>, StoreError>;
    fn email_history(&self, lead_id: Uuid) -> Result<Vec<EmailHistoryEntry>, StoreError>;

    fn failed_jobs(&self, campaign_id: Uuid) -> Result<Vec<Job>, StoreError>;
    /// FAILED → PENDING with `scheduled_at = now` and `attempts = 0`.
    /// Returns false when the job is missing or not FAILED.
    fn retry_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError>;
    fn retry_all_failed(&self, campaign_id: Uuid, now: DateTime<Utc>) -> Result<u64, StoreError>;

    fn next_pending_job(&self, campaign_id: Uuid) -> Result<Option<Job>, StoreError>;
    /// Pull the earliest PENDING job's `scheduled_at` to now.
    fn send_now(&self, campaign_id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;
    fn step_summary(&self, campaign_id: Uuid) -> Result<Vec<StepSummary>, StoreError>;
    fn campaign_stats(&self, campaign_id: Uuid) -> Result<Option<CampaignStats>, StoreError>;

    /// Resolve a lead from a provider message id recorded on one of its
    /// sent jobs.
    fn lead_by_message_id(&self, message_id: &str) -> Result<Option<Lead>, StoreError>;

    /// DRAFT → ACTIVE; creates the step-1 job for every non-terminal lead
    /// in the same transaction. Requires at least one lead and a step-1
    /// template.
    fn launch_campaign(
        &self,
        campaign_id: Uuid,
        step_one_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Campaign, LifecycleError>;

    /// Pause/resume edges. `from` pins the expected current status so a
    /// resume cannot activate a DRAFT campaign.
    fn transition_campaign(
        &self,
        campaign_id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<Campaign, LifecycleError>;

    fn delete_campaign(&self, campaign_id: Uuid) -> Result<(), LifecycleError>;
    fn duplicate_campaign(
        &self,
        campaign_id: Uuid,
        name: Option<&str>,
    ) -> Result<Campaign, LifecycleError>;

    /// ACTIVE → COMPLETED when no PENDING jobs remain and every lead is
    /// terminal or has been sent the campaign's final step.
    fn try_complete_campaign(&self, campaign_id: Uuid) -> Result<bool, StoreError>;

    /// Set the lead REPLIED and cancel its pending jobs, atomically.
    /// Idempotent: a terminal lead is left untouched.
    fn mark_lead_replied(&self, lead_id: Uuid) -> Result<ReplyRecord, StoreError>;

    /// Fail the bounced job; the lead becomes FAILED only when no other job
    /// for it has already been sent.
    fn record_bounce(&self, message_id: &str, description: &str)
        -> Result<BounceRecord, StoreError>;

    fn create_user(&self, email: &str, signature_html: Option<&str>) -> Result<User, StoreError>;
    fn create_campaign(
        &self,
        user_id: Uuid,
        name: &str,
        pitch: Option<&str>,
        tone: Option<&str>,
    ) -> Result<Campaign, LifecycleError>;
    /// DRAFT campaigns only; email is lowercased and unique per campaign.
    fn create_lead(
        &self,
        campaign_id: Uuid,
        email: &str,
        first_name: Option<&str>,
        company: Option<&str>,
    ) -> Result<Lead, LifecycleError>;
    fn upsert_template(
        &self,
        campaign_id: Uuid,
        step_number: i32,
        subject: &str,
        body_html: &str,
        delay_minutes: i64,
    ) -> Result<Template, LifecycleError>;
    fn add_tag(&self, campaign_id: Uuid, tag: &str) -> Result<(), LifecycleError>;
    fn remove_tag(&self, campaign_id: Uuid, tag: &str) -> Result<bool, LifecycleError>;
}
