pub mod clock;
pub mod service;
pub mod testing;
pub mod transport;

mod campaign;

pub use campaign::{
    dispatcher::{
        start_dispatcher, Dispatcher, DispatcherControl, DispatcherSettings, JobOutcome,
        TickStats,
    },
    lifecycle::{CampaignLifecycle, LifecycleError},
    render::{render, RenderedEmail},
    reply::{BounceOutcome, ReplyIngestor, ReplyOutcome},
    schedule,
    store::{
        memory::MemoryStore, pg::PgStore, BounceRecord, CampaignStats, ClaimedJob,
        EmailHistoryEntry, NextStep, ReplyRecord, StepSummary, Store, StoreError,
    },
    types::{Campaign, CampaignStatus, Job, JobStatus, Lead, LeadStatus, Template, User},
};
