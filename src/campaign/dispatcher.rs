use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::transport::{reply_address_with_token, EmailTransport, OutboundEmail, TransportError};

use super::render::render;
use super::schedule::{follow_up_at, retry_at, DEFAULT_MAX_RETRY_ATTEMPTS};
use super::store::{ClaimedJob, NextStep, Store, StoreError};
use super::types::CampaignStatus;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_attempts: i32,
    pub from_address: String,
    pub from_name: String,
    pub reply_to: Option<String>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            from_address: String::new(),
            from_name: String::new(),
            reply_to: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Sent,
    Retried,
    Failed,
    Skipped,
    /// Campaign not active: the row was left PENDING and will be
    /// re-checked next tick.
    Deferred,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TickStats {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub completed_campaigns: usize,
}

/// Background worker. Safe to run from any number of threads or processes
/// against the same database: claims are disjoint by construction.
pub struct Dispatcher<S: Store> {
    store: Arc<S>,
    transport: Arc<dyn EmailTransport>,
    clock: Arc<dyn Clock>,
    settings: DispatcherSettings,
}

impl<S: Store> Dispatcher<S> {
    pub fn new(
        store: Arc<S>,
        transport: Arc<dyn EmailTransport>,
        clock: Arc<dyn Clock>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            settings,
        }
    }

    pub fn run_loop(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            match self.tick() {
                Ok(stats) => {
                    if stats.claimed > 0 {
                        info!(
                            "dispatcher tick: claimed={} sent={} retried={} failed={} \
                             skipped={} deferred={}",
                            stats.claimed,
                            stats.sent,
                            stats.retried,
                            stats.failed,
                            stats.skipped,
                            stats.deferred
                        );
                    }
                }
                Err(err) => {
                    // Contention and connection drops are transient; the
                    // next tick retries.
                    error!("dispatcher tick failed: {}", err);
                }
            }
            thread::sleep(self.settings.poll_interval);
        }
    }

    /// One poll cycle: claim each due job in its own transaction, execute
    /// it, then run the completion check for every touched campaign.
    pub fn tick(&self) -> Result<TickStats, StoreError> {
        let now = self.clock.now();
        let due = self.store.due_job_ids(now, self.settings.batch_size)?;

        let mut stats = TickStats::default();
        let mut touched: HashSet<Uuid> = HashSet::new();
        for job_id in due {
            let Some(claim) = self.store.claim_job(job_id, self.clock.now())? else {
                // Another worker holds the row, or it is no longer due.
                continue;
            };
            stats.claimed += 1;
            let campaign_id = claim.job().campaign_id;
            match self.execute_claim(claim) {
                Ok(outcome) => {
                    match outcome {
                        JobOutcome::Sent => stats.sent += 1,
                        JobOutcome::Retried => stats.retried += 1,
                        JobOutcome::Failed => stats.failed += 1,
                        JobOutcome::Skipped => stats.skipped += 1,
                        JobOutcome::Deferred => stats.deferred += 1,
                    }
                    if outcome != JobOutcome::Deferred {
                        touched.insert(campaign_id);
                    }
                }
                Err(err) => {
                    error!("job {} execution failed: {}", job_id, err);
                }
            }
        }

        for campaign_id in touched {
            if self.store.try_complete_campaign(campaign_id)? {
                info!("campaign completed: {}", campaign_id);
                stats.completed_campaigns += 1;
            }
        }
        Ok(stats)
    }

    /// Final validation, render, send, and outcome, all under the claim's
    /// row lock so a concurrent reply either commits before the re-read
    /// here or after this job is durably SENT.
    fn execute_claim(&self, mut claim: S::Claim) -> Result<JobOutcome, StoreError> {
        let job = claim.job().clone();

        let Some(campaign) = claim.campaign()? else {
            claim.commit_skipped("campaign missing")?;
            return Ok(JobOutcome::Skipped);
        };
        if campaign.status != CampaignStatus::Active {
            // Pause never mutates job rows; the claim rolls back and the
            // row is reconsidered on a later tick.
            claim.release()?;
            return Ok(JobOutcome::Deferred);
        }

        let Some(lead) = claim.lead()? else {
            claim.commit_skipped("lead missing")?;
            return Ok(JobOutcome::Skipped);
        };
        if lead.status.is_terminal() {
            claim.commit_skipped(&format!("lead terminal: {}", lead.status.as_str()))?;
            return Ok(JobOutcome::Skipped);
        }

        let Some(template) = claim.template_for_step(job.step_number)? else {
            claim.commit_skipped("template missing")?;
            return Ok(JobOutcome::Skipped);
        };

        let owner = claim.owner()?;
        let signature = owner.as_ref().and_then(|user| user.signature_html.as_deref());
        let rendered = render(&template, &lead, signature);
        let reply_to = self
            .settings
            .reply_to
            .as_deref()
            .and_then(|address| reply_address_with_token(address, &lead.id.to_string()));
        let email = OutboundEmail {
            from: format!("{} <{}>", self.settings.from_name, self.settings.from_address),
            reply_to,
            to: lead.email.clone(),
            subject: rendered.subject,
            html_body: rendered.body_html,
            headers: Vec::new(),
        };

        let next_template = claim.template_for_step(job.step_number + 1)?;
        let attempt = job.attempts + 1;

        let send_result = catch_unwind(AssertUnwindSafe(|| self.transport.send(&email)));
        match send_result {
            Ok(Ok(message_id)) => {
                let sent_at = self.clock.now();
                let next = next_template.as_ref().map(|template| NextStep {
                    step_number: template.step_number,
                    scheduled_at: follow_up_at(sent_at, template),
                });
                claim.commit_sent(sent_at, &message_id, next)?;
                info!(
                    "job {} sent to {} (step {}, message_id {})",
                    job.id, lead.email, job.step_number, message_id
                );
                Ok(JobOutcome::Sent)
            }
            Ok(Err(TransportError::Permanent(reason))) => {
                warn!("job {} failed permanently: {}", job.id, reason);
                claim.commit_failed(&reason)?;
                Ok(JobOutcome::Failed)
            }
            Ok(Err(TransportError::Transient(reason))) => {
                self.handle_transient(claim, attempt, &reason)
            }
            Err(panic) => {
                let reason = format!("send panicked: {}", panic_message(panic));
                error!("job {}: {}", job.id, reason);
                self.handle_transient(claim, attempt, &reason)
            }
        }
    }

    fn handle_transient(
        &self,
        claim: S::Claim,
        attempt: i32,
        reason: &str,
    ) -> Result<JobOutcome, StoreError> {
        let job_id = claim.job().id;
        if attempt >= self.settings.max_attempts {
            error!(
                "job {} failed after {} attempts: {}",
                job_id, attempt, reason
            );
            claim.commit_failed(reason)?;
            Ok(JobOutcome::Failed)
        } else {
            let next_at = retry_at(self.clock.now(), attempt);
            warn!(
                "job {} attempt {} failed, retrying at {}: {}",
                job_id, attempt, next_at, reason
            );
            claim.commit_retry(next_at, reason)?;
            Ok(JobOutcome::Retried)
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct DispatcherControl {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl DispatcherControl {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_and_join(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Spawn `workers` dispatcher threads sharing one stop flag. Shutdown rolls
/// back any in-flight claim, so interrupted jobs revert to PENDING.
pub fn start_dispatcher<S: Store>(dispatcher: Arc<Dispatcher<S>>, workers: usize) -> DispatcherControl {
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::with_capacity(workers.max(1));
    for _ in 0..workers.max(1) {
        let dispatcher = dispatcher.clone();
        let stop = stop.clone();
        handles.push(thread::spawn(move || dispatcher.run_loop(&stop)));
    }
    DispatcherControl { stop, handles }
}
