use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use uuid::Uuid;

use campaign_module::clock::Clock;
use campaign_module::testing::{ManualClock, MockSend, MockTransport};
use campaign_module::transport::EmailTransport;
use campaign_module::{
    CampaignLifecycle, CampaignStatus, Dispatcher, DispatcherSettings, Job, JobStatus,
    LeadStatus, MemoryStore, Store,
};

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    transport: Arc<MockTransport>,
    dispatcher: Arc<Dispatcher<MemoryStore>>,
    lifecycle: CampaignLifecycle<MemoryStore>,
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
    Harness {
        store,
        clock,
        transport,
        dispatcher,
        lifecycle,
    }
}

fn two_step_campaign(harness: &Harness, lead_emails: &[&str]) -> (Uuid, Vec<Uuid>) {
    let user = harness
        .store
        .create_user("owner@example.com", Some("<p>-- Owner</p>"))
        .expect("user");
    let campaign = harness
        .store
        .create_campaign(user.id, "Spring outreach", Some("pitch"), Some("direct"))
        .expect("campaign");
    harness
        .store
        .upsert_template(campaign.id, 1, "Hi {{first_name}}", "<p>Intro</p>", 0)
        .expect("step 1");
    harness
        .store
        .upsert_template(campaign.id, 2, "Following up", "<p>Ping</p>", 60)
        .expect("step 2");
    let leads = lead_emails
        .iter()
        .map(|email| {
            harness
                .store
                .create_lead(campaign.id, email, Some("Ada"), Some("Engines"))
                .expect("lead")
                .id
        })
        .collect();
    (campaign.id, leads)
}

fn jobs(harness: &Harness, lead_id: Uuid) -> Vec<Job> {
    harness.store.jobs_for_lead(lead_id).expect("jobs")
}

#[test]
fn happy_path_two_steps_one_lead() {
    let harness = harness();
    let (campaign_id, leads) = two_step_campaign(&harness, &["ada@example.com"]);
    let lead_id = leads[0];
    let launch_at = harness.clock.now();

    harness.lifecycle.launch(campaign_id, None).expect("launch");
    let step_one = &jobs(&harness, lead_id)[0];
    assert_eq!(step_one.scheduled_at, launch_at);

    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.sent, 1);

    let all = jobs(&harness, lead_id);
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].status, JobStatus::Sent);
    let step_one_sent_at = all[0].sent_at.expect("sent_at");
    assert!(step_one_sent_at >= all[0].scheduled_at);
    assert!(all[0].message_id.is_some());
    assert_eq!(all[1].status, JobStatus::Pending);
    assert_eq!(all[1].scheduled_at, step_one_sent_at + Duration::minutes(60));

    let lead = harness
        .store
        .load_lead(lead_id)
        .expect("load")
        .expect("lead");
    assert_eq!(lead.status, LeadStatus::Contacted);

    // Not due yet: nothing happens.
    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.claimed, 0);

    harness.clock.advance(Duration::minutes(60));
    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.completed_campaigns, 1);

    let all = jobs(&harness, lead_id);
    assert_eq!(all[1].status, JobStatus::Sent);
    let step_two_sent_at = all[1].sent_at.expect("sent_at");
    assert!(step_two_sent_at >= step_one_sent_at + Duration::minutes(60));

    let campaign = harness
        .store
        .load_campaign(campaign_id)
        .expect("load")
        .expect("campaign");
    assert_eq!(campaign.status, CampaignStatus::Completed);

    let sent = harness.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].subject, "Hi Ada");
    assert!(sent[0].html_body.contains("<p>-- Owner</p>"));
    assert_eq!(sent[1].subject, "Following up");
    assert_eq!(
        sent[0].reply_to.as_deref(),
        Some(format!("reply+{lead_id}@outreach.example").as_str())
    );
}

#[test]
fn pause_defers_jobs_without_mutating_them() {
    let harness = harness();
    let (campaign_id, leads) =
        two_step_campaign(&harness, &["ada@example.com", "grace@example.com"]);

    harness.lifecycle.launch(campaign_id, None).expect("launch");
    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.sent, 2);

    harness.clock.advance(Duration::minutes(10));
    harness.lifecycle.pause(campaign_id).expect("pause");

    let scheduled_before: Vec<_> = leads
        .iter()
        .map(|lead_id| jobs(&harness, *lead_id)[1].scheduled_at)
        .collect();

    // Follow-ups are due but the campaign is paused: rows stay PENDING,
    // untouched, and are re-checked every tick.
    harness.clock.advance(Duration::minutes(50));
    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.deferred, 2);
    assert_eq!(stats.sent, 0);
    for (lead_id, before) in leads.iter().zip(&scheduled_before) {
        let step_two = &jobs(&harness, *lead_id)[1];
        assert_eq!(step_two.status, JobStatus::Pending);
        assert_eq!(step_two.scheduled_at, *before);
        assert_eq!(step_two.attempts, 0);
    }

    harness.lifecycle.resume(campaign_id).expect("resume");
    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.sent, 2);
    assert_eq!(harness.transport.sent_count(), 4);
}

#[test]
fn transient_failure_retries_with_backoff() {
    let harness = harness();
    let (campaign_id, leads) = two_step_campaign(&harness, &["ada@example.com"]);
    let lead_id = leads[0];
    harness.lifecycle.launch(campaign_id, None).expect("launch");

    harness
        .transport
        .push_response(MockSend::Transient("connection reset".to_string()));
    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.retried, 1);

    let job = &jobs(&harness, lead_id)[0];
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("connection reset"));
    assert_eq!(job.scheduled_at, harness.clock.now() + Duration::seconds(60));

    // Not due until the backoff elapses.
    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.claimed, 0);

    harness.clock.advance(Duration::seconds(60));
    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.sent, 1);
    let job = &jobs(&harness, lead_id)[0];
    assert_eq!(job.status, JobStatus::Sent);
    assert_eq!(job.attempts, 2);
}

#[test]
fn transient_failures_exhaust_into_failed_lead() {
    let harness = harness();
    let (campaign_id, leads) = two_step_campaign(&harness, &["ada@example.com"]);
    let lead_id = leads[0];
    harness.lifecycle.launch(campaign_id, None).expect("launch");

    for _ in 0..3 {
        harness
            .transport
            .push_response(MockSend::Transient("timeout".to_string()));
        harness.dispatcher.tick().expect("tick");
        harness.clock.advance(Duration::hours(2));
    }

    let job = &jobs(&harness, lead_id)[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    let lead = harness
        .store
        .load_lead(lead_id)
        .expect("load")
        .expect("lead");
    assert_eq!(lead.status, LeadStatus::Failed);
    assert_eq!(harness.transport.sent_count(), 0);
}

#[test]
fn permanent_failure_fails_immediately() {
    let harness = harness();
    let (campaign_id, leads) = two_step_campaign(&harness, &["ada@example.com"]);
    let lead_id = leads[0];
    harness.lifecycle.launch(campaign_id, None).expect("launch");

    harness
        .transport
        .push_response(MockSend::Permanent("invalid address".to_string()));
    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed_campaigns, 1);

    let job = &jobs(&harness, lead_id)[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("invalid address"));
    let lead = harness
        .store
        .load_lead(lead_id)
        .expect("load")
        .expect("lead");
    assert_eq!(lead.status, LeadStatus::Failed);

    // The sole lead is terminal, so the campaign is done.
    let campaign = harness
        .store
        .load_campaign(campaign_id)
        .expect("load")
        .expect("campaign");
    assert_eq!(campaign.status, CampaignStatus::Completed);
}

#[test]
fn panic_in_transport_is_a_transient_failure() {
    let harness = harness();
    let (campaign_id, leads) = two_step_campaign(&harness, &["ada@example.com"]);
    let lead_id = leads[0];
    harness.lifecycle.launch(campaign_id, None).expect("launch");

    harness
        .transport
        .push_response(MockSend::Panic("provider SDK bug".to_string()));
    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.retried, 1);

    let job = &jobs(&harness, lead_id)[0];
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job
        .last_error
        .as_deref()
        .expect("last_error")
        .contains("provider SDK bug"));

    harness.clock.advance(Duration::seconds(60));
    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.sent, 1);
}

#[test]
fn retried_job_is_dispatched_again() {
    let harness = harness();
    let (campaign_id, leads) = two_step_campaign(&harness, &["ada@example.com"]);
    let lead_id = leads[0];
    harness.lifecycle.launch(campaign_id, None).expect("launch");

    harness
        .transport
        .push_response(MockSend::Permanent("domain unverified".to_string()));
    harness.dispatcher.tick().expect("tick");

    let failed = jobs(&harness, lead_id)[0].clone();
    assert_eq!(failed.status, JobStatus::Failed);

    harness.clock.advance(Duration::hours(1));
    assert!(harness
        .store
        .retry_job(failed.id, harness.clock.now())
        .expect("retry"));
    let stats = harness.dispatcher.tick().expect("tick");
    assert_eq!(stats.sent, 1);
    let job = &jobs(&harness, lead_id)[0];
    assert_eq!(job.status, JobStatus::Sent);
    assert_eq!(job.attempts, 1);
}

#[test]
fn concurrent_workers_send_each_job_exactly_once() {
    let harness = harness();
    let emails: Vec<String> = (0..100).map(|n| format!("lead{n}@example.com")).collect();
    let email_refs: Vec<&str> = emails.iter().map(String::as_str).collect();
    let (campaign_id, leads) = {
        let user = harness
            .store
            .create_user("owner@example.com", None)
            .expect("user");
        let campaign = harness
            .store
            .create_campaign(user.id, "Blast", None, None)
            .expect("campaign");
        harness
            .store
            .upsert_template(campaign.id, 1, "Hi {{first_name}}", "<p>Hi</p>", 0)
            .expect("template");
        let leads: Vec<Uuid> = email_refs
            .iter()
            .map(|email| {
                harness
                    .store
                    .create_lead(campaign.id, email, None, None)
                    .expect("lead")
                    .id
            })
            .collect();
        (campaign.id, leads)
    };
    harness.lifecycle.launch(campaign_id, None).expect("launch");

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let dispatcher = harness.dispatcher.clone();
            std::thread::spawn(move || loop {
                let stats = dispatcher.tick().expect("tick");
                if stats.claimed == 0 {
                    break;
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker thread");
    }

    assert_eq!(harness.transport.sent_count(), 100);
    let mut message_ids = std::collections::HashSet::new();
    for lead_id in &leads {
        let all = jobs(&harness, *lead_id);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, JobStatus::Sent);
        assert!(message_ids.insert(all[0].message_id.clone().expect("message_id")));
    }
    assert_eq!(message_ids.len(), 100);
}

#[test]
fn terminal_jobs_never_exceed_max_attempts() {
    let harness = harness();
    let (campaign_id, leads) = two_step_campaign(&harness, &["ada@example.com"]);
    harness.lifecycle.launch(campaign_id, None).expect("launch");

    for _ in 0..5 {
        harness
            .transport
            .push_response(MockSend::Transient("flaky".to_string()));
        harness.dispatcher.tick().expect("tick");
        harness.clock.advance(Duration::hours(2));
    }

    for job in jobs(&harness, leads[0]) {
        assert!(job.attempts <= 3, "attempts {} > max", job.attempts);
    }
}
