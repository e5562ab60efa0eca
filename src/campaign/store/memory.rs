use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::campaign::lifecycle::LifecycleError;
use crate::campaign::types::{
    normalize_email, Campaign, CampaignStatus, Job, JobStatus, Lead, LeadStatus, Template, User,
};

use super::{
    BounceRecord, CampaignStats, ClaimedJob, EmailHistoryEntry, NextStep, ReplyRecord,
    StepSummary, Store, StoreError,
};

fn canonical_message_id(raw: &str) -> String {
    raw.trim()
        .trim_matches(|ch| matches!(ch, '<' | '>'))
        .to_ascii_lowercase()
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    campaigns: HashMap<Uuid, Campaign>,
    leads: HashMap<Uuid, Lead>,
    templates: HashMap<Uuid, Template>,
    jobs: HashMap<Uuid, Job>,
    claimed: HashSet<Uuid>,
}

impl Inner {
    fn max_template_step(&self, campaign_id: Uuid) -> Option<i32> {
        self.templates
            .values()
            .filter(|template| template.campaign_id == campaign_id)
            .map(|template| template.step_number)
            .max()
    }

    fn template_for(&self, campaign_id: Uuid, step_number: i32) -> Option<Template> {
        self.templates
            .values()
            .find(|template| {
                template.campaign_id == campaign_id && template.step_number == step_number
            })
            .cloned()
    }

    fn lead_has_sent(&self, lead_id: Uuid, excluding: Option<Uuid>) -> bool {
        self.jobs.values().any(|job| {
            job.lead_id == lead_id
                && job.status == JobStatus::Sent
                && Some(job.id) != excluding
        })
    }

    /// Skip every unclaimed PENDING job for the lead. A claimed row is the
    /// in-memory stand-in for a locked one: its outcome is decided by the
    /// worker holding the claim.
    fn cancel_pending(&mut self, lead_id: Uuid, reason: &str, excluding: Option<Uuid>) -> u64 {
        let claimed = self.claimed.clone();
        let mut canceled = 0u64;
        for job in self.jobs.values_mut() {
            if job.lead_id != lead_id
                || job.status != JobStatus::Pending
                || Some(job.id) == excluding
                || claimed.contains(&job.id)
            {
                continue;
            }
            job.status = JobStatus::Skipped;
            job.last_error = Some(reason.to_string());
            job.updated_at = Utc::now();
            canceled += 1;
        }
        canceled
    }

    fn insert_job_idempotent(
        &mut self,
        campaign_id: Uuid,
        lead_id: Uuid,
        step_number: i32,
        scheduled_at: DateTime<Utc>,
    ) -> Job {
        if let Some(existing) = self
            .jobs
            .values()
            .find(|job| {
                job.lead_id == lead_id
                    && job.step_number == step_number
                    && job.status != JobStatus::Failed
            })
            .cloned()
        {
            return existing;
        }
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            campaign_id,
            lead_id,
            step_number,
            status: JobStatus::Pending,
            scheduled_at,
            sent_at: None,
            attempts: 0,
            last_error: None,
            message_id: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.insert(job.id, job.clone());
        job
    }
}

/// In-process store with the same atomicity and claim semantics as
/// [`super::pg::PgStore`], used by the test suite and by scenarios that do
/// not want a database. All state sits behind one mutex, so every trait
/// method is atomic by construction.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

pub struct MemoryClaim {
    inner: Arc<Mutex<Inner>>,
    job: Job,
    open: bool,
}

impl MemoryClaim {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn finish(mut self) {
        self.lock().claimed.remove(&self.job.id);
        self.open = false;
    }
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        if self.open {
            // Uncommitted claim: the job stays PENDING, as a rolled-back
            // transaction would leave it.
            self.inner
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .claimed
                .remove(&self.job.id);
        }
    }
}

impl ClaimedJob for MemoryClaim {
    fn job(&self) -> &Job {
        &self.job
    }

    fn campaign(&mut self) -> Result<Option<Campaign>, StoreError> {
        Ok(self.lock().campaigns.get(&self.job.campaign_id).cloned())
    }

    fn lead(&mut self) -> Result<Option<Lead>, StoreError> {
        Ok(self.lock().leads.get(&self.job.lead_id).cloned())
    }

    fn owner(&mut self) -> Result<Option<User>, StoreError> {
        let inner = self.lock();
        let user_id = inner
            .campaigns
            .get(&self.job.campaign_id)
            .map(|campaign| campaign.user_id);
        Ok(user_id.and_then(|id| inner.users.get(&id).cloned()))
    }

    fn template_for_step(&mut self, step_number: i32) -> Result<Option<Template>, StoreError> {
        Ok(self.lock().template_for(self.job.campaign_id, step_number))
    }

    fn release(self) -> Result<(), StoreError> {
        self.finish();
        Ok(())
    }

    fn commit_skipped(self, reason: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            if let Some(job) = inner.jobs.get_mut(&self.job.id) {
                job.status = JobStatus::Skipped;
                job.last_error = Some(reason.to_string());
                job.updated_at = Utc::now();
            }
        }
        self.finish();
        Ok(())
    }

    fn commit_sent(
        self,
        sent_at: DateTime<Utc>,
        message_id: &str,
        next: Option<NextStep>,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            if let Some(job) = inner.jobs.get_mut(&self.job.id) {
                job.status = JobStatus::Sent;
                job.sent_at = Some(sent_at);
                job.message_id = Some(message_id.to_string());
                job.attempts += 1;
                job.last_error = None;
                job.updated_at = sent_at;
            }
            if let Some(lead) = inner.leads.get_mut(&self.job.lead_id) {
                if lead.status == LeadStatus::Pending {
                    lead.status = LeadStatus::Contacted;
                    lead.updated_at = sent_at;
                }
            }
            if let Some(next) = next {
                inner.insert_job_idempotent(
                    self.job.campaign_id,
                    self.job.lead_id,
                    next.step_number,
                    next.scheduled_at,
                );
            }
        }
        self.finish();
        Ok(())
    }

    fn commit_retry(self, next_at: DateTime<Utc>, error: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            if let Some(job) = inner.jobs.get_mut(&self.job.id) {
                job.attempts += 1;
                job.scheduled_at = next_at;
                job.last_error = Some(error.to_string());
                job.updated_at = Utc::now();
            }
        }
        self.finish();
        Ok(())
    }

    fn commit_failed(self, error: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            if let Some(job) = inner.jobs.get_mut(&self.job.id) {
                job.status = JobStatus::Failed;
                job.attempts += 1;
                job.last_error = Some(error.to_string());
                job.updated_at = Utc::now();
            }
            let has_other_sent = inner.lead_has_sent(self.job.lead_id, Some(self.job.id));
            let mut lead_failed = false;
            if let Some(lead) = inner.leads.get_mut(&self.job.lead_id) {
                if !lead.status.is_terminal() && !has_other_sent {
                    lead.status = LeadStatus::Failed;
                    lead.updated_at = Utc::now();
                    lead_failed = true;
                }
            }
            if lead_failed {
                inner.cancel_pending(self.job.lead_id, "lead terminal", Some(self.job.id));
            }
        }
        self.finish();
        Ok(())
    }
}

impl Store for MemoryStore {
    type Claim = MemoryClaim;

    fn due_job_ids(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.lock();
        let mut due: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.scheduled_at <= now)
            .collect();
        due.sort_by_key(|job| (job.scheduled_at, job.campaign_id, job.lead_id, job.step_number));
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|job| job.id)
            .collect())
    }

    fn claim_job(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<MemoryClaim>, StoreError> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get(&job_id).cloned() else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending
            || job.scheduled_at > now
            || inner.claimed.contains(&job_id)
        {
            return Ok(None);
        }
        inner.claimed.insert(job_id);
        Ok(Some(MemoryClaim {
            inner: self.inner.clone(),
            job,
            open: true,
        }))
    }

    fn create_job(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
        step_number: i32,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        Ok(self
            .lock()
            .insert_job_idempotent(campaign_id, lead_id, step_number, scheduled_at))
    }

    fn cancel_pending_jobs_for_lead(
        &self,
        lead_id: Uuid,
        reason: &str,
    ) -> Result<u64, StoreError> {
        Ok(self.lock().cancel_pending(lead_id, reason, None))
    }

    fn load_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError> {
        Ok(self.lock().campaigns.get(&id).cloned())
    }

    fn load_lead(&self, id: Uuid) -> Result<Option<Lead>, StoreError> {
        Ok(self.lock().leads.get(&id).cloned())
    }

    fn load_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.lock().users.get(&id).cloned())
    }

    fn load_template(
        &self,
        campaign_id: Uuid,
        step_number: i32,
    ) -> Result<Option<Template>, StoreError> {
        Ok(self.lock().template_for(campaign_id, step_number))
    }

    fn load_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    fn templates_for_campaign(&self, campaign_id: Uuid) -> Result<Vec<Template>, StoreError> {
        let inner = self.lock();
        let mut templates: Vec<Template> = inner
            .templates
            .values()
            .filter(|template| template.campaign_id == campaign_id)
            .cloned()
            .collect();
        templates.sort_by_key(|template| template.step_number);
        Ok(templates)
    }

    fn leads_for_campaign(
        &self,
        campaign_id: Uuid,
        status: Option<LeadStatus>,
    ) -> Result<Vec<Lead>, StoreError> {
        let inner = self.lock();
        let mut leads: Vec<Lead> = inner
            .leads
            .values()
            .filter(|lead| {
                lead.campaign_id == campaign_id
                    && status.map(|status| lead.status == status).unwrap_or(true)
            })
            .cloned()
            .collect();
        leads.sort_by_key(|lead| lead.created_at);
        Ok(leads)
    }

    fn jobs_for_lead(&self, lead_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.lead_id == lead_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.step_number);
        Ok(jobs)
    }

    fn email_history(&self, lead_id: Uuid) -> Result<Vec<EmailHistoryEntry>, StoreError> {
        let jobs = self.jobs_for_lead(lead_id)?;
        let inner = self.lock();
        Ok(jobs
            .into_iter()
            .map(|job| {
                let subject = inner
                    .template_for(job.campaign_id, job.step_number)
                    .map(|template| template.subject);
                EmailHistoryEntry {
                    step_number: job.step_number,
                    status: job.status,
                    scheduled_at: job.scheduled_at,
                    sent_at: job.sent_at,
                    subject,
                    attempts: job.attempts,
                    last_error: job.last_error,
                }
            })
            .collect())
    }

    fn failed_jobs(&self, campaign_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.campaign_id == campaign_id && job.status == JobStatus::Failed)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.scheduled_at);
        Ok(jobs)
    }

    fn retry_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Failed {
            return Ok(false);
        }
        job.status = JobStatus::Pending;
        job.scheduled_at = now;
        job.attempts = 0;
        job.last_error = None;
        job.sent_at = None;
        job.message_id = None;
        job.updated_at = now;
        let lead_id = job.lead_id;
        let has_sent = inner.lead_has_sent(lead_id, None);
        if let Some(lead) = inner.leads.get_mut(&lead_id) {
            if lead.status == LeadStatus::Failed {
                lead.status = if has_sent {
                    LeadStatus::Contacted
                } else {
                    LeadStatus::Pending
                };
                lead.updated_at = now;
            }
        }
        Ok(true)
    }

    fn retry_all_failed(&self, campaign_id: Uuid, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let failed: Vec<Uuid> = self
            .failed_jobs(campaign_id)?
            .into_iter()
            .map(|job| job.id)
            .collect();
        let mut count = 0u64;
        for job_id in failed {
            if self.retry_job(job_id, now)? {
                count += 1;
            }
        }
        Ok(count)
    }

    fn next_pending_job(&self, campaign_id: Uuid) -> Result<Option<Job>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.campaign_id == campaign_id && job.status == JobStatus::Pending)
            .min_by_key(|job| (job.scheduled_at, job.lead_id, job.step_number))
            .cloned())
    }

    fn send_now(&self, campaign_id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let next = self.next_pending_job(campaign_id)?;
        let Some(next) = next else {
            return Ok(None);
        };
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(&next.id) {
            job.scheduled_at = now;
            job.updated_at = now;
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }

    fn step_summary(&self, campaign_id: Uuid) -> Result<Vec<StepSummary>, StoreError> {
        let inner = self.lock();
        let mut by_step: HashMap<i32, StepSummary> = HashMap::new();
        for job in inner.jobs.values() {
            if job.campaign_id != campaign_id {
                continue;
            }
            let lead_terminal = inner
                .leads
                .get(&job.lead_id)
                .map(|lead| lead.status.is_terminal())
                .unwrap_or(false);
            let entry = by_step.entry(job.step_number).or_insert(StepSummary {
                step_number: job.step_number,
                sent: 0,
                pending: 0,
                failed: 0,
                skipped: 0,
                next_scheduled_at: None,
            });
            match job.status {
                JobStatus::Sent => entry.sent += 1,
                JobStatus::Pending if !lead_terminal => {
                    entry.pending += 1;
                    entry.next_scheduled_at = match entry.next_scheduled_at {
                        Some(at) if at <= job.scheduled_at => Some(at),
                        _ => Some(job.scheduled_at),
                    };
                }
                JobStatus::Pending => {}
                JobStatus::Failed => entry.failed += 1,
                JobStatus::Skipped => entry.skipped += 1,
            }
        }
        let mut summaries: Vec<StepSummary> = by_step.into_values().collect();
        summaries.sort_by_key(|summary| summary.step_number);
        Ok(summaries)
    }

    fn campaign_stats(&self, campaign_id: Uuid) -> Result<Option<CampaignStats>, StoreError> {
        let inner = self.lock();
        let Some(campaign) = inner.campaigns.get(&campaign_id).cloned() else {
            return Ok(None);
        };
        let mut stats = CampaignStats {
            campaign,
            total_leads: 0,
            pending_leads: 0,
            contacted_leads: 0,
            replied_leads: 0,
            failed_leads: 0,
            pending_jobs: 0,
        };
        for lead in inner.leads.values() {
            if lead.campaign_id != campaign_id {
                continue;
            }
            stats.total_leads += 1;
            match lead.status {
                LeadStatus::Pending => stats.pending_leads += 1,
                LeadStatus::Contacted => stats.contacted_leads += 1,
                LeadStatus::Replied => stats.replied_leads += 1,
                LeadStatus::Failed => stats.failed_leads += 1,
            }
        }
        stats.pending_jobs = inner
            .jobs
            .values()
            .filter(|job| job.campaign_id == campaign_id && job.status == JobStatus::Pending)
            .count() as i64;
        Ok(Some(stats))
    }

    fn lead_by_message_id(&self, message_id: &str) -> Result<Option<Lead>, StoreError> {
        let needle = canonical_message_id(message_id);
        let inner = self.lock();
        let lead_id = inner.jobs.values().find_map(|job| {
            let recorded = canonical_message_id(job.message_id.as_deref()?);
            (recorded == needle).then_some(job.lead_id)
        });
        Ok(lead_id.and_then(|id| inner.leads.get(&id).cloned()))
    }

    fn launch_campaign(
        &self,
        campaign_id: Uuid,
        step_one_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Campaign, LifecycleError> {
        let mut inner = self.lock();
        let Some(campaign) = inner.campaigns.get(&campaign_id).cloned() else {
            return Err(LifecycleError::NotFound("campaign not found".to_string()));
        };
        if campaign.status != CampaignStatus::Draft {
            return Err(LifecycleError::InvalidTransition(
                "campaign must be in draft status to launch".to_string(),
            ));
        }
        if inner.template_for(campaign_id, 1).is_none() {
            return Err(LifecycleError::Validation(
                "campaign must have a step 1 template".to_string(),
            ));
        }
        let lead_ids: Vec<Uuid> = inner
            .leads
            .values()
            .filter(|lead| lead.campaign_id == campaign_id && !lead.status.is_terminal())
            .map(|lead| lead.id)
            .collect();
        if lead_ids.is_empty() {
            return Err(LifecycleError::Validation(
                "campaign must have at least one lead".to_string(),
            ));
        }
        for lead_id in lead_ids {
            inner.insert_job_idempotent(campaign_id, lead_id, 1, step_one_at);
        }
        let Some(campaign) = inner.campaigns.get_mut(&campaign_id) else {
            return Err(LifecycleError::NotFound("campaign not found".to_string()));
        };
        campaign.status = CampaignStatus::Active;
        campaign.start_time = Some(step_one_at);
        campaign.updated_at = now;
        Ok(campaign.clone())
    }

    fn transition_campaign(
        &self,
        campaign_id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<Campaign, LifecycleError> {
        let mut inner = self.lock();
        let Some(campaign) = inner.campaigns.get_mut(&campaign_id) else {
            return Err(LifecycleError::NotFound("campaign not found".to_string()));
        };
        if campaign.status != from || !CampaignStatus::can_transition(from, to) {
            return Err(LifecycleError::InvalidTransition(format!(
                "cannot transition campaign from {} to {}",
                campaign.status.as_str(),
                to.as_str()
            )));
        }
        campaign.status = to;
        campaign.updated_at = Utc::now();
        Ok(campaign.clone())
    }

    fn delete_campaign(&self, campaign_id: Uuid) -> Result<(), LifecycleError> {
        let mut inner = self.lock();
        let Some(campaign) = inner.campaigns.get(&campaign_id) else {
            return Err(LifecycleError::NotFound("campaign not found".to_string()));
        };
        if campaign.status != CampaignStatus::Draft {
            return Err(LifecycleError::InvalidTransition(
                "only draft campaigns can be deleted".to_string(),
            ));
        }
        inner.campaigns.remove(&campaign_id);
        inner.leads.retain(|_, lead| lead.campaign_id != campaign_id);
        inner
            .templates
            .retain(|_, template| template.campaign_id != campaign_id);
        inner.jobs.retain(|_, job| job.campaign_id != campaign_id);
        Ok(())
    }

    fn duplicate_campaign(
        &self,
        campaign_id: Uuid,
        name: Option<&str>,
    ) -> Result<Campaign, LifecycleError> {
        let mut inner = self.lock();
        let Some(original) = inner.campaigns.get(&campaign_id).cloned() else {
            return Err(LifecycleError::NotFound("campaign not found".to_string()));
        };
        let now = Utc::now();
        let copy = Campaign {
            id: Uuid::new_v4(),
            user_id: original.user_id,
            name: name
                .map(|name| name.to_string())
                .unwrap_or_else(|| format!("{} (Copy)", original.name)),
            pitch: original.pitch.clone(),
            tone: original.tone.clone(),
            status: CampaignStatus::Draft,
            start_time: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let templates: Vec<Template> = inner
            .templates
            .values()
            .filter(|template| template.campaign_id == campaign_id)
            .cloned()
            .collect();
        for template in templates {
            let duplicate = Template {
                id: Uuid::new_v4(),
                campaign_id: copy.id,
                created_at: now,
                updated_at: now,
                ..template
            };
            inner.templates.insert(duplicate.id, duplicate);
        }
        inner.campaigns.insert(copy.id, copy.clone());
        Ok(copy)
    }

    fn try_complete_campaign(&self, campaign_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(campaign) = inner.campaigns.get(&campaign_id) else {
            return Ok(false);
        };
        if campaign.status != CampaignStatus::Active {
            return Ok(false);
        }
        let has_pending = inner
            .jobs
            .values()
            .any(|job| job.campaign_id == campaign_id && job.status == JobStatus::Pending);
        if has_pending {
            return Ok(false);
        }
        let max_step = inner.max_template_step(campaign_id);
        let unfinished = inner.leads.values().any(|lead| {
            lead.campaign_id == campaign_id
                && !lead.status.is_terminal()
                && !max_step
                    .map(|step| {
                        inner.jobs.values().any(|job| {
                            job.lead_id == lead.id
                                && job.status == JobStatus::Sent
                                && job.step_number == step
                        })
                    })
                    .unwrap_or(false)
        });
        if unfinished {
            return Ok(false);
        }
        let Some(campaign) = inner.campaigns.get_mut(&campaign_id) else {
            return Ok(false);
        };
        campaign.status = CampaignStatus::Completed;
        campaign.updated_at = Utc::now();
        Ok(true)
    }

    fn mark_lead_replied(&self, lead_id: Uuid) -> Result<ReplyRecord, StoreError> {
        let mut inner = self.lock();
        let Some(lead) = inner.leads.get(&lead_id).cloned() else {
            return Ok(ReplyRecord::NotFound);
        };
        if lead.status.is_terminal() {
            return Ok(ReplyRecord::AlreadyTerminal(lead));
        }
        let canceled = inner.cancel_pending(lead_id, "lead terminal", None);
        let now = Utc::now();
        let Some(lead) = inner.leads.get_mut(&lead_id) else {
            return Ok(ReplyRecord::NotFound);
        };
        lead.status = LeadStatus::Replied;
        lead.updated_at = now;
        Ok(ReplyRecord::Replied {
            lead: lead.clone(),
            canceled_jobs: canceled,
        })
    }

    fn record_bounce(
        &self,
        message_id: &str,
        description: &str,
    ) -> Result<BounceRecord, StoreError> {
        let needle = canonical_message_id(message_id);
        let mut inner = self.lock();
        let Some(mut job) = inner
            .jobs
            .values()
            .find(|job| {
                job.message_id
                    .as_deref()
                    .map(|recorded| canonical_message_id(recorded) == needle)
                    .unwrap_or(false)
            })
            .cloned()
        else {
            return Ok(BounceRecord::NoMatch);
        };

        if let Some(stored) = inner.jobs.get_mut(&job.id) {
            stored.status = JobStatus::Failed;
            stored.last_error = Some(description.to_string());
            stored.updated_at = Utc::now();
            job = stored.clone();
        }
        let has_other_sent = inner.lead_has_sent(job.lead_id, Some(job.id));
        let mut lead_failed = false;
        if let Some(lead) = inner.leads.get_mut(&job.lead_id) {
            if !lead.status.is_terminal() && !has_other_sent {
                lead.status = LeadStatus::Failed;
                lead.updated_at = Utc::now();
                lead_failed = true;
            }
        }
        if lead_failed {
            inner.cancel_pending(job.lead_id, "lead terminal", Some(job.id));
        }
        Ok(BounceRecord::Recorded { job, lead_failed })
    }

    fn create_user(&self, email: &str, signature_html: Option<&str>) -> Result<User, StoreError> {
        let mut inner = self.lock();
        let email = normalize_email(email);
        if let Some(existing) = inner.users.values_mut().find(|user| user.email == email) {
            existing.signature_html = signature_html.map(|value| value.to_string());
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email,
            signature_html: signature_html.map(|value| value.to_string()),
            profile_completed: false,
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    fn create_campaign(
        &self,
        user_id: Uuid,
        name: &str,
        pitch: Option<&str>,
        tone: Option<&str>,
    ) -> Result<Campaign, LifecycleError> {
        let mut inner = self.lock();
        if !inner.users.contains_key(&user_id) {
            return Err(LifecycleError::NotFound("user not found".to_string()));
        }
        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            pitch: pitch.map(|value| value.to_string()),
            tone: tone.map(|value| value.to_string()),
            status: CampaignStatus::Draft,
            start_time: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        inner.campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    fn create_lead(
        &self,
        campaign_id: Uuid,
        email: &str,
        first_name: Option<&str>,
        company: Option<&str>,
    ) -> Result<Lead, LifecycleError> {
        let mut inner = self.lock();
        let Some(campaign) = inner.campaigns.get(&campaign_id) else {
            return Err(LifecycleError::NotFound("campaign not found".to_string()));
        };
        if campaign.status != CampaignStatus::Draft {
            return Err(LifecycleError::InvalidTransition(
                "can only add leads to campaigns in draft status".to_string(),
            ));
        }
        let email = normalize_email(email);
        if !email.contains('@') {
            return Err(LifecycleError::Validation(format!(
                "invalid email format: {}",
                email
            )));
        }
        let duplicate = inner
            .leads
            .values()
            .any(|lead| lead.campaign_id == campaign_id && lead.email == email);
        if duplicate {
            return Err(LifecycleError::Validation(format!(
                "email {} already exists in this campaign",
                email
            )));
        }
        let now = Utc::now();
        let lead = Lead {
            id: Uuid::new_v4(),
            campaign_id,
            email,
            first_name: first_name.map(|value| value.to_string()),
            company: company.map(|value| value.to_string()),
            status: LeadStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        inner.leads.insert(lead.id, lead.clone());
        Ok(lead)
    }

    fn upsert_template(
        &self,
        campaign_id: Uuid,
        step_number: i32,
        subject: &str,
        body_html: &str,
        delay_minutes: i64,
    ) -> Result<Template, LifecycleError> {
        if step_number < 1 {
            return Err(LifecycleError::Validation(
                "step_number must be at least 1".to_string(),
            ));
        }
        let mut inner = self.lock();
        if !inner.campaigns.contains_key(&campaign_id) {
            return Err(LifecycleError::NotFound("campaign not found".to_string()));
        }
        let now = Utc::now();
        if let Some(existing) = inner.templates.values_mut().find(|template| {
            template.campaign_id == campaign_id && template.step_number == step_number
        }) {
            existing.subject = subject.to_string();
            existing.body_html = body_html.to_string();
            existing.delay_minutes = delay_minutes;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let template = Template {
            id: Uuid::new_v4(),
            campaign_id,
            step_number,
            subject: subject.to_string(),
            body_html: body_html.to_string(),
            delay_minutes,
            created_at: now,
            updated_at: now,
        };
        inner.templates.insert(template.id, template.clone());
        Ok(template)
    }

    fn add_tag(&self, campaign_id: Uuid, tag: &str) -> Result<(), LifecycleError> {
        let tag = tag.trim().to_string();
        if tag.is_empty() {
            return Err(LifecycleError::Validation("tag cannot be empty".to_string()));
        }
        let mut inner = self.lock();
        let Some(campaign) = inner.campaigns.get_mut(&campaign_id) else {
            return Err(LifecycleError::NotFound("campaign not found".to_string()));
        };
        if campaign.tags.contains(&tag) {
            return Err(LifecycleError::Validation(
                "tag already exists for this campaign".to_string(),
            ));
        }
        campaign.tags.push(tag);
        campaign.tags.sort();
        Ok(())
    }

    fn remove_tag(&self, campaign_id: Uuid, tag: &str) -> Result<bool, LifecycleError> {
        let mut inner = self.lock();
        let Some(campaign) = inner.campaigns.get_mut(&campaign_id) else {
            return Err(LifecycleError::NotFound("campaign not found".to_string()));
        };
        let before = campaign.tags.len();
        let tag = tag.trim();
        campaign.tags.retain(|existing| existing != tag);
        Ok(campaign.tags.len() < before)
    }
}
