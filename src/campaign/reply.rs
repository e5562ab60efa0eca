use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::transport::{normalize_message_id, InboundBounce, InboundEmail};

use super::store::{BounceRecord, ReplyRecord, Store, StoreError};
use super::types::Lead;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Lead moved to REPLIED; pending follow-ups were canceled.
    Recorded { lead_id: Uuid, canceled_jobs: u64 },
    /// Replayed webhook or a lead already FAILED; nothing changed.
    AlreadyTerminal { lead_id: Uuid },
    /// No lead matched the message. Logged and acknowledged.
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BounceOutcome {
    Recorded { job_id: Uuid, lead_failed: bool },
    NoMatch,
}

/// Correlates inbound webhooks to leads and short-circuits their future
/// sends. Replays are no-ops because the lead is already terminal on the
/// second delivery.
pub struct ReplyIngestor<S: Store> {
    store: Arc<S>,
}

impl<S: Store> ReplyIngestor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn record_reply(&self, inbound: &InboundEmail) -> Result<ReplyOutcome, StoreError> {
        let Some(lead) = self.resolve_lead(inbound)? else {
            info!(
                "inbound reply from {} matched no lead (in_reply_to {:?})",
                inbound.from.as_deref().unwrap_or("unknown"),
                inbound.in_reply_to
            );
            return Ok(ReplyOutcome::NoMatch);
        };
        self.mark_replied(lead.id)
    }

    /// Shared by the webhook path and the simulated-reply endpoint.
    pub fn mark_replied(&self, lead_id: Uuid) -> Result<ReplyOutcome, StoreError> {
        match self.store.mark_lead_replied(lead_id)? {
            ReplyRecord::NotFound => Ok(ReplyOutcome::NoMatch),
            ReplyRecord::AlreadyTerminal(lead) => {
                info!(
                    "reply for lead {} ignored: already {}",
                    lead.id,
                    lead.status.as_str()
                );
                Ok(ReplyOutcome::AlreadyTerminal { lead_id: lead.id })
            }
            ReplyRecord::Replied {
                lead,
                canceled_jobs,
            } => {
                info!(
                    "lead {} marked replied, canceled {} pending job(s)",
                    lead.id, canceled_jobs
                );
                self.store.try_complete_campaign(lead.campaign_id)?;
                Ok(ReplyOutcome::Recorded {
                    lead_id: lead.id,
                    canceled_jobs,
                })
            }
        }
    }

    pub fn record_bounce(&self, bounce: &InboundBounce) -> Result<BounceOutcome, StoreError> {
        let Some(message_id) = bounce
            .message_id
            .as_deref()
            .and_then(normalize_message_id)
        else {
            warn!(
                "bounce for {} carried no message id",
                bounce.email.as_deref().unwrap_or("unknown")
            );
            return Ok(BounceOutcome::NoMatch);
        };
        let description = match bounce.description.as_deref() {
            Some(description) if !description.trim().is_empty() => {
                format!("bounced: {}", description.trim())
            }
            _ => "bounced".to_string(),
        };
        match self.store.record_bounce(&message_id, &description)? {
            BounceRecord::NoMatch => {
                info!("bounce matched no job (message_id {})", message_id);
                Ok(BounceOutcome::NoMatch)
            }
            BounceRecord::Recorded { job, lead_failed } => {
                warn!(
                    "bounce recorded for job {} (lead failed: {})",
                    job.id, lead_failed
                );
                self.store.try_complete_campaign(job.campaign_id)?;
                Ok(BounceOutcome::Recorded {
                    job_id: job.id,
                    lead_failed,
                })
            }
        }
    }

    /// A reply is correlated either by the plus-addressing token minted
    /// into Reply-To at send time, or by joining In-Reply-To / References
    /// against the message ids recorded on sent jobs.
    fn resolve_lead(&self, inbound: &InboundEmail) -> Result<Option<Lead>, StoreError> {
        if let Some(token) = inbound.routing_token.as_deref() {
            if let Ok(lead_id) = Uuid::parse_str(token.trim()) {
                if let Some(lead) = self.store.load_lead(lead_id)? {
                    return Ok(Some(lead));
                }
            }
        }
        for candidate in [inbound.in_reply_to.as_deref(), inbound.references.as_deref()] {
            let Some(raw) = candidate else {
                continue;
            };
            for token in raw.split_whitespace() {
                let Some(message_id) = normalize_message_id(token) else {
                    continue;
                };
                if let Some(lead) = self.store.lead_by_message_id(&message_id)? {
                    return Ok(Some(lead));
                }
            }
        }
        Ok(None)
    }
}
