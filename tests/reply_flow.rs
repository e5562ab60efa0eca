use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use uuid::Uuid;

use campaign_module::clock::Clock;
use campaign_module::testing::{ManualClock, MockTransport};
use campaign_module::transport::{EmailTransport, InboundBounce, InboundEmail};
use campaign_module::{
    BounceOutcome, CampaignLifecycle, CampaignStatus, Dispatcher, DispatcherSettings, JobStatus,
    LeadStatus, MemoryStore, ReplyIngestor, ReplyOutcome, Store,
};

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    transport: Arc<MockTransport>,
    dispatcher: Arc<Dispatcher<MemoryStore>>,
    lifecycle: CampaignLifecycle<MemoryStore>,
    ingestor: ReplyIngestor<MemoryStore>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::at_origin());
    let transport = Arc::new(MockTransport::new());
    let transport_dyn: Arc<dyn EmailTransport> = transport.clone();
    let clock_dyn: Arc<dyn Clock> = clock.clone();
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        transport_dyn,
        clock_dyn.clone(),
        DispatcherSettings {
            poll_interval: StdDuration::from_millis(10),
            batch_size: 100,
            max_attempts: 3,
            from_address: "hello@outreach.example".to_string(),
            from_name: "Outreach".to_string(),
            reply_to: Some("reply@outreach.example".to_string()),
        },
    ));
    let lifecycle = CampaignLifecycle::new(store.clone(), clock_dyn);
    let ingestor = ReplyIngestor::new(store.clone());
    Harness {
        store,
        clock,
        transport,
        dispatcher,
        lifecycle,
        ingestor,
    }
}

fn launched_two_step_campaign(harness: &Harness) -> (Uuid, Uuid) {
    let user = harness
        .store
        .create_user("owner@example.com", None)
        .expect("user");
    let campaign = harness
        .store
        .create_campaign(user.id, "Spring outreach", None, None)
        .expect("campaign");
    harness
        .store
        .upsert_template(campaign.id, 1, "Hi {{first_name}}", "<p>Intro</p>", 0)
        .expect("step 1");
    harness
        .store
        .upsert_template(campaign.id, 2, "Following up", "<p>Ping</p>", 60)
        .expect("step 2");
    let lead = harness
        .store
        .create_lead(campaign.id, "ada@example.com", Some("Ada"), None)
        .expect("lead");
    harness.lifecycle.launch(campaign.id, None).expect("launch");
    (campaign.id, lead.id)
}

fn reply_referencing(message_id: &str) -> InboundEmail {
    InboundEmail {
        from: Some("ada@example.com".to_string()),
        to: Some("reply@outreach.example".to_string()),
        subject: Some("Re: Hi Ada".to_string()),
        text_body: Some("Sounds interesting".to_string()),
        message_id: Some("<inbound-1@example.com>".to_string()),
        in_reply_to: Some(message_id.to_string()),
        references: None,
        routing_token: None,
    }
}

#[test]
fn reply_cancels_pending_follow_up() {
    let harness = harness();
    let (campaign_id, lead_id) = launched_two_step_campaign(&harness);

    harness.dispatcher.tick().expect("tick");
    let step_one_message = harness
        .store
        .jobs_for_lead(lead_id)
        .expect("jobs")[0]
        .message_id
        .clone()
        .expect("message_id");

    harness.clock.advance(Duration::minutes(30));
    let outcome = harness
        .ingestor
        .record_reply(&reply_referencing(&step_one_message))
        .expect("ingest");
    assert_eq!(
        outcome,
        ReplyOutcome::Recorded {
            lead_id,
            canceled_jobs: 1
        }
    );

    let replied_at = harness.clock.now();
    let lead = harness
        .store
        .load_lead(lead_id)
        .expect("load")
        .expect("lead");
    assert_eq!(lead.status, LeadStatus::Replied);
    let jobs = harness.store.jobs_for_lead(lead_id).expect("jobs");
    assert_eq!(jobs[1].status, JobStatus::Skipped);
    assert_eq!(jobs[1].last_error.as_deref(), Some("lead terminal"));

    // The follow-up slot comes due, but nothing is sent.
    harness.clock.advance(Duration::minutes(30));
    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.claimed, 0);
    assert_eq!(harness.transport.sent_count(), 1);
    for job in harness.store.jobs_for_lead(lead_id).expect("jobs") {
        if let Some(sent_at) = job.sent_at {
            assert!(sent_at <= replied_at);
        }
    }

    let campaign = harness
        .store
        .load_campaign(campaign_id)
        .expect("load")
        .expect("campaign");
    assert_eq!(campaign.status, CampaignStatus::Completed);
}

#[test]
fn reply_resolves_by_routing_token() {
    let harness = harness();
    let (_campaign_id, lead_id) = launched_two_step_campaign(&harness);
    harness.dispatcher.tick().expect("tick");

    let inbound = InboundEmail {
        routing_token: Some(lead_id.to_string()),
        ..InboundEmail::default()
    };
    let outcome = harness.ingestor.record_reply(&inbound).expect("ingest");
    assert_eq!(
        outcome,
        ReplyOutcome::Recorded {
            lead_id,
            canceled_jobs: 1
        }
    );
}

#[test]
fn webhook_replay_is_idempotent() {
    let harness = harness();
    let (_campaign_id, lead_id) = launched_two_step_campaign(&harness);
    harness.dispatcher.tick().expect("tick");
    let message_id = harness
        .store
        .jobs_for_lead(lead_id)
        .expect("jobs")[0]
        .message_id
        .clone()
        .expect("message_id");

    let inbound = reply_referencing(&message_id);
    let first = harness.ingestor.record_reply(&inbound).expect("ingest");
    assert!(matches!(first, ReplyOutcome::Recorded { .. }));
    let jobs_after_first = harness.store.jobs_for_lead(lead_id).expect("jobs");

    let second = harness.ingestor.record_reply(&inbound).expect("ingest");
    assert_eq!(second, ReplyOutcome::AlreadyTerminal { lead_id });
    let jobs_after_second = harness.store.jobs_for_lead(lead_id).expect("jobs");

    assert_eq!(jobs_after_first.len(), jobs_after_second.len());
    for (first, second) in jobs_after_first.iter().zip(&jobs_after_second) {
        assert_eq!(first.status, second.status);
        assert_eq!(first.updated_at, second.updated_at);
    }
}

#[test]
fn unmatched_reply_is_acknowledged_without_changes() {
    let harness = harness();
    launched_two_step_campaign(&harness);
    harness.dispatcher.tick().expect("tick");

    let outcome = harness
        .ingestor
        .record_reply(&reply_referencing("<unknown@nowhere>"))
        .expect("ingest");
    assert_eq!(outcome, ReplyOutcome::NoMatch);
}

#[test]
fn simulated_reply_uses_the_same_path() {
    let harness = harness();
    let (_campaign_id, lead_id) = launched_two_step_campaign(&harness);
    harness.dispatcher.tick().expect("tick");

    let outcome = harness.ingestor.mark_replied(lead_id).expect("mark");
    assert_eq!(
        outcome,
        ReplyOutcome::Recorded {
            lead_id,
            canceled_jobs: 1
        }
    );
    let lead = harness
        .store
        .load_lead(lead_id)
        .expect("load")
        .expect("lead");
    assert_eq!(lead.status, LeadStatus::Replied);
}

#[test]
fn bounce_fails_lead_without_prior_success() {
    let harness = harness();
    let (_campaign_id, lead_id) = launched_two_step_campaign(&harness);
    harness.dispatcher.tick().expect("tick");
    let jobs = harness.store.jobs_for_lead(lead_id).expect("jobs");
    let step_one = jobs[0].clone();

    let bounce = InboundBounce {
        email: Some("ada@example.com".to_string()),
        bounce_type: Some("HardBounce".to_string()),
        description: Some("mailbox unavailable".to_string()),
        message_id: step_one.message_id.clone(),
    };
    let outcome = harness.ingestor.record_bounce(&bounce).expect("bounce");
    assert_eq!(
        outcome,
        BounceOutcome::Recorded {
            job_id: step_one.id,
            lead_failed: true
        }
    );

    let lead = harness
        .store
        .load_lead(lead_id)
        .expect("load")
        .expect("lead");
    assert_eq!(lead.status, LeadStatus::Failed);
    let jobs = harness.store.jobs_for_lead(lead_id).expect("jobs");
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(
        jobs[0].last_error.as_deref(),
        Some("bounced: mailbox unavailable")
    );
    // The pending follow-up is canceled with the lead.
    assert_eq!(jobs[1].status, JobStatus::Skipped);

    // Replaying the bounce changes nothing further.
    let replay = harness.ingestor.record_bounce(&bounce).expect("bounce");
    assert_eq!(
        replay,
        BounceOutcome::Recorded {
            job_id: step_one.id,
            lead_failed: false
        }
    );
}

#[test]
fn bounce_spares_lead_with_an_earlier_successful_step() {
    let harness = harness();
    let (_campaign_id, lead_id) = launched_two_step_campaign(&harness);

    harness.dispatcher.tick().expect("tick");
    harness.clock.advance(Duration::minutes(60));
    harness.dispatcher.tick().expect("tick");

    let jobs = harness.store.jobs_for_lead(lead_id).expect("jobs");
    assert_eq!(jobs[1].status, JobStatus::Sent);

    // Step 2 bounces, but step 1 already landed.
    let bounce = InboundBounce {
        email: Some("ada@example.com".to_string()),
        bounce_type: Some("HardBounce".to_string()),
        description: None,
        message_id: jobs[1].message_id.clone(),
    };
    let outcome = harness.ingestor.record_bounce(&bounce).expect("bounce");
    assert_eq!(
        outcome,
        BounceOutcome::Recorded {
            job_id: jobs[1].id,
            lead_failed: false
        }
    );
    let lead = harness
        .store
        .load_lead(lead_id)
        .expect("load")
        .expect("lead");
    assert_eq!(lead.status, LeadStatus::Contacted);
}

#[test]
fn bounce_without_match_is_ignored() {
    let harness = harness();
    launched_two_step_campaign(&harness);

    let bounce = InboundBounce {
        email: Some("gone@example.com".to_string()),
        bounce_type: Some("HardBounce".to_string()),
        description: None,
        message_id: Some("<never-sent@nowhere>".to_string()),
    };
    assert_eq!(
        harness.ingestor.record_bounce(&bounce).expect("bounce"),
        BounceOutcome::NoMatch
    );
}
