use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use crate::testing::ManualClock;

use super::lifecycle::{CampaignLifecycle, LifecycleError};
use super::store::memory::MemoryStore;
use super::store::{ClaimedJob, NextStep, ReplyRecord, Store};
use super::types::{Campaign, CampaignStatus, JobStatus, Lead, LeadStatus};

fn fixture(store: &MemoryStore) -> (Campaign, Lead) {
    let user = store
        .create_user("owner@example.com", Some("<p>-- Owner</p>"))
        .expect("create user");
    let campaign = store
        .create_campaign(user.id, "Spring outreach", Some("pitch"), Some("professional"))
        .expect("create campaign");
    store
        .upsert_template(campaign.id, 1, "Hi {{first_name}}", "<p>Intro</p>", 0)
        .expect("step 1 template");
    store
        .upsert_template(campaign.id, 2, "Following up", "<p>Ping</p>", 60)
        .expect("step 2 template");
    let lead = store
        .create_lead(campaign.id, "Ada@Example.com", Some("Ada"), Some("Engines"))
        .expect("create lead");
    (campaign, lead)
}

#[test]
fn campaign_transition_table() {
    use CampaignStatus::*;
    assert!(CampaignStatus::can_transition(Draft, Active));
    assert!(CampaignStatus::can_transition(Active, Paused));
    assert!(CampaignStatus::can_transition(Paused, Active));
    assert!(CampaignStatus::can_transition(Active, Completed));
    assert!(CampaignStatus::can_transition(Paused, Completed));
    assert!(!CampaignStatus::can_transition(Draft, Paused));
    assert!(!CampaignStatus::can_transition(Completed, Active));
    assert!(!CampaignStatus::can_transition(Active, Draft));
}

#[test]
fn lead_email_is_normalized_and_unique_per_campaign() {
    let store = MemoryStore::new();
    let (campaign, lead) = fixture(&store);
    assert_eq!(lead.email, "ada@example.com");

    let duplicate = store.create_lead(campaign.id, "ADA@example.com", None, None);
    assert!(matches!(duplicate, Err(LifecycleError::Validation(_))));
}

#[test]
fn launch_requires_draft_leads_and_step_one_template() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::at_origin());
    let lifecycle = CampaignLifecycle::new(Arc::new(store.clone()), clock.clone());

    let user = store.create_user("owner@example.com", None).expect("user");
    let empty = store
        .create_campaign(user.id, "No leads", None, None)
        .expect("campaign");
    store
        .upsert_template(empty.id, 1, "Hi", "<p>Hi</p>", 0)
        .expect("template");
    assert!(matches!(
        lifecycle.launch(empty.id, None),
        Err(LifecycleError::Validation(_))
    ));

    let bare = store
        .create_campaign(user.id, "No template", None, None)
        .expect("campaign");
    store
        .create_lead(bare.id, "lead@example.com", None, None)
        .expect("lead");
    assert!(matches!(
        lifecycle.launch(bare.id, None),
        Err(LifecycleError::Validation(_))
    ));

    assert!(matches!(
        lifecycle.launch(Uuid::new_v4(), None),
        Err(LifecycleError::NotFound(_))
    ));
}

#[test]
fn launch_creates_step_one_jobs_and_rejects_relaunch() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::at_origin());
    let lifecycle = CampaignLifecycle::new(Arc::new(store.clone()), clock.clone());
    let (campaign, lead) = fixture(&store);

    let launched = lifecycle.launch(campaign.id, None).expect("launch");
    assert_eq!(launched.status, CampaignStatus::Active);
    assert_eq!(launched.start_time, Some(clock.now()));

    let jobs = store.jobs_for_lead(lead.id).expect("jobs");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].step_number, 1);
    assert_eq!(jobs[0].status, JobStatus::Pending);
    assert_eq!(jobs[0].scheduled_at, clock.now());

    let second = lifecycle.launch(campaign.id, None);
    assert!(matches!(second, Err(LifecycleError::InvalidTransition(_))));
    assert_eq!(store.jobs_for_lead(lead.id).expect("jobs").len(), 1);
}

#[test]
fn launch_clamps_past_start_time_to_now() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::at_origin());
    let lifecycle = CampaignLifecycle::new(Arc::new(store.clone()), clock.clone());
    let (campaign, lead) = fixture(&store);

    let past = clock.now() - Duration::hours(6);
    lifecycle.launch(campaign.id, Some(past)).expect("launch");
    let jobs = store.jobs_for_lead(lead.id).expect("jobs");
    assert_eq!(jobs[0].scheduled_at, clock.now());
}

#[test]
fn pause_and_resume_leave_job_rows_untouched() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::at_origin());
    let lifecycle = CampaignLifecycle::new(Arc::new(store.clone()), clock.clone());
    let (campaign, lead) = fixture(&store);
    lifecycle.launch(campaign.id, None).expect("launch");

    let before = store.jobs_for_lead(lead.id).expect("jobs");
    lifecycle.pause(campaign.id).expect("pause");
    lifecycle.resume(campaign.id).expect("resume");
    let after = store.jobs_for_lead(lead.id).expect("jobs");

    assert_eq!(before.len(), after.len());
    assert_eq!(before[0].scheduled_at, after[0].scheduled_at);
    assert_eq!(before[0].status, after[0].status);

    // Resume only applies to paused campaigns.
    assert!(matches!(
        lifecycle.resume(campaign.id),
        Err(LifecycleError::InvalidTransition(_))
    ));
}

#[test]
fn delete_is_draft_only() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::at_origin());
    let lifecycle = CampaignLifecycle::new(Arc::new(store.clone()), clock);
    let (campaign, _lead) = fixture(&store);

    lifecycle.launch(campaign.id, None).expect("launch");
    assert!(matches!(
        lifecycle.delete(campaign.id),
        Err(LifecycleError::InvalidTransition(_))
    ));
}

#[test]
fn duplicate_copies_templates_but_not_leads_or_jobs() {
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::at_origin());
    let lifecycle = CampaignLifecycle::new(Arc::new(store.clone()), clock);
    let (campaign, _lead) = fixture(&store);

    let copy = lifecycle
        .duplicate(campaign.id, Some("Second wave"))
        .expect("duplicate");
    assert_eq!(copy.name, "Second wave");
    assert_eq!(copy.status, CampaignStatus::Draft);
    assert_eq!(
        store.templates_for_campaign(copy.id).expect("templates").len(),
        2
    );
    assert!(store
        .leads_for_campaign(copy.id, None)
        .expect("leads")
        .is_empty());

    let unnamed = lifecycle.duplicate(campaign.id, None).expect("duplicate");
    assert_eq!(unnamed.name, "Spring outreach (Copy)");
}

#[test]
fn create_job_is_idempotent_for_live_rows() {
    let store = MemoryStore::new();
    let (campaign, lead) = fixture(&store);
    let clock = ManualClock::at_origin();

    let first = store
        .create_job(campaign.id, lead.id, 1, clock.now())
        .expect("create");
    let second = store
        .create_job(campaign.id, lead.id, 1, clock.now() + Duration::hours(1))
        .expect("create again");
    assert_eq!(first.id, second.id);
    assert_eq!(second.scheduled_at, clock.now());
}

#[test]
fn claim_is_exclusive_and_rolls_back_on_drop() {
    let store = MemoryStore::new();
    let (campaign, lead) = fixture(&store);
    let clock = ManualClock::at_origin();
    let job = store
        .create_job(campaign.id, lead.id, 1, clock.now())
        .expect("create");

    let claim = store.claim_job(job.id, clock.now()).expect("claim");
    assert!(claim.is_some());
    // Second worker is skipped while the row is locked.
    assert!(store.claim_job(job.id, clock.now()).expect("claim").is_none());

    drop(claim);
    // Rollback leaves the row PENDING and claimable again.
    let reclaimed = store.claim_job(job.id, clock.now()).expect("claim");
    assert!(reclaimed.is_some());
    let reclaimed = reclaimed.expect("claimed");
    assert_eq!(reclaimed.job().status, JobStatus::Pending);
    reclaimed.release().expect("release");
}

#[test]
fn claim_commit_sent_advances_lead_and_enqueues_next() {
    let store = MemoryStore::new();
    let (campaign, lead) = fixture(&store);
    let clock = ManualClock::at_origin();
    let job = store
        .create_job(campaign.id, lead.id, 1, clock.now())
        .expect("create");

    let claim = store
        .claim_job(job.id, clock.now())
        .expect("claim")
        .expect("claimed");
    let sent_at = clock.now();
    claim
        .commit_sent(
            sent_at,
            "<msg-1@test>",
            Some(NextStep {
                step_number: 2,
                scheduled_at: sent_at + Duration::minutes(60),
            }),
        )
        .expect("commit");

    let jobs = store.jobs_for_lead(lead.id).expect("jobs");
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].status, JobStatus::Sent);
    assert_eq!(jobs[0].attempts, 1);
    assert_eq!(jobs[0].sent_at, Some(sent_at));
    assert_eq!(jobs[0].message_id.as_deref(), Some("<msg-1@test>"));
    assert_eq!(jobs[1].status, JobStatus::Pending);
    assert_eq!(jobs[1].scheduled_at, sent_at + Duration::minutes(60));

    let lead = store.load_lead(lead.id).expect("load").expect("lead");
    assert_eq!(lead.status, LeadStatus::Contacted);
}

#[test]
fn commit_failed_spares_lead_with_prior_success() {
    let store = MemoryStore::new();
    let (campaign, lead) = fixture(&store);
    let clock = ManualClock::at_origin();

    let step_one = store
        .create_job(campaign.id, lead.id, 1, clock.now())
        .expect("create");
    store
        .claim_job(step_one.id, clock.now())
        .expect("claim")
        .expect("claimed")
        .commit_sent(clock.now(), "<msg-1@test>", None)
        .expect("commit");

    let step_two = store
        .create_job(campaign.id, lead.id, 2, clock.now())
        .expect("create");
    store
        .claim_job(step_two.id, clock.now())
        .expect("claim")
        .expect("claimed")
        .commit_failed("address rejected")
        .expect("commit");

    let lead = store.load_lead(lead.id).expect("load").expect("lead");
    assert_eq!(lead.status, LeadStatus::Contacted);
}

#[test]
fn mark_lead_replied_cancels_pending_and_is_idempotent() {
    let store = MemoryStore::new();
    let (campaign, lead) = fixture(&store);
    let clock = ManualClock::at_origin();
    store
        .create_job(campaign.id, lead.id, 1, clock.now())
        .expect("create");

    let first = store.mark_lead_replied(lead.id).expect("reply");
    match first {
        ReplyRecord::Replied {
            canceled_jobs,
            ref lead,
        } => {
            assert_eq!(canceled_jobs, 1);
            assert_eq!(lead.status, LeadStatus::Replied);
        }
        other => panic!("expected Replied, got {:?}", other),
    }

    let replay = store.mark_lead_replied(lead.id).expect("reply");
    assert!(matches!(replay, ReplyRecord::AlreadyTerminal(_)));

    let jobs = store.jobs_for_lead(lead.id).expect("jobs");
    assert_eq!(jobs[0].status, JobStatus::Skipped);
    assert_eq!(jobs[0].last_error.as_deref(), Some("lead terminal"));
}

#[test]
fn completion_requires_no_pending_work_and_settled_leads() {
    let store = MemoryStore::new();
    let (campaign, lead) = fixture(&store);
    let clock = ManualClock::at_origin();
    let lifecycle = CampaignLifecycle::new(
        Arc::new(store.clone()),
        Arc::new(ManualClock::at_origin()),
    );
    lifecycle.launch(campaign.id, None).expect("launch");

    // Step 1 still pending.
    assert!(!store.try_complete_campaign(campaign.id).expect("check"));

    let jobs = store.jobs_for_lead(lead.id).expect("jobs");
    store
        .claim_job(jobs[0].id, clock.now())
        .expect("claim")
        .expect("claimed")
        .commit_sent(clock.now(), "<msg-1@test>", None)
        .expect("commit");

    // Lead contacted but final step not sent.
    assert!(!store.try_complete_campaign(campaign.id).expect("check"));

    let step_two = store
        .create_job(campaign.id, lead.id, 2, clock.now())
        .expect("create");
    store
        .claim_job(step_two.id, clock.now())
        .expect("claim")
        .expect("claimed")
        .commit_sent(clock.now(), "<msg-2@test>", None)
        .expect("commit");

    assert!(store.try_complete_campaign(campaign.id).expect("check"));
    let campaign = store
        .load_campaign(campaign.id)
        .expect("load")
        .expect("campaign");
    assert_eq!(campaign.status, CampaignStatus::Completed);
}

#[test]
fn retry_job_resets_failed_job_and_revives_lead() {
    let store = MemoryStore::new();
    let (campaign, lead) = fixture(&store);
    let clock = ManualClock::at_origin();
    let job = store
        .create_job(campaign.id, lead.id, 1, clock.now())
        .expect("create");
    store
        .claim_job(job.id, clock.now())
        .expect("claim")
        .expect("claimed")
        .commit_failed("mailbox full")
        .expect("commit");

    assert_eq!(
        store.load_lead(lead.id).expect("load").expect("lead").status,
        LeadStatus::Failed
    );

    let later = clock.now() + Duration::hours(1);
    assert!(store.retry_job(job.id, later).expect("retry"));
    let job = store.load_job(job.id).expect("load").expect("job");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.scheduled_at, later);
    assert_eq!(
        store.load_lead(lead.id).expect("load").expect("lead").status,
        LeadStatus::Pending
    );

    // Only FAILED jobs can be retried.
    assert!(!store.retry_job(job.id, later).expect("retry"));
}
