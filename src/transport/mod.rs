use serde::{Deserialize, Serialize};

pub mod postmark;
pub mod resend;

pub use postmark::PostmarkTransport;
pub use resend::ResendTransport;

/// Transient errors are retried with backoff; permanent ones fail the job
/// immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transient transport error: {0}")]
    Transient(String),
    #[error("permanent transport error: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub from: String,
    pub reply_to: Option<String>,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub headers: Vec<(String, String)>,
}

/// Provider-neutral view of an inbound reply webhook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundEmail {
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub text_body: Option<String>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    /// Plus-addressing token extracted from the recipient address
    /// (`reply+<token>@domain`).
    pub routing_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundBounce {
    pub email: Option<String>,
    pub bounce_type: Option<String>,
    pub description: Option<String>,
    pub message_id: Option<String>,
}

/// Outbound-send capability plus inbound payload parsing. Implementations
/// must be safe to call from multiple worker threads; the send call blocks
/// and is bounded by the client timeout (30 s).
pub trait EmailTransport: Send + Sync {
    fn name(&self) -> &'static str;
    fn send(&self, email: &OutboundEmail) -> Result<String, TransportError>;
    fn parse_inbound(&self, body: &[u8]) -> Result<InboundEmail, TransportError>;
    fn parse_bounce(&self, body: &[u8]) -> Result<InboundBounce, TransportError>;
}

/// Strip angle brackets and lowercase, the canonical form used for
/// correlation. Empty input yields `None`.
pub fn normalize_message_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches(|ch| matches!(ch, '<' | '>'));
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

/// First message id in a References-style header.
pub fn extract_first_message_id(value: &str) -> Option<String> {
    for token in value.split(|ch: char| matches!(ch, ' ' | '\t' | '\n' | '\r' | ',' | ';')) {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(id) = normalize_message_id(trimmed) {
            return Some(id);
        }
    }
    None
}

/// `reply@domain` + token → `reply+token@domain`. `None` when the base
/// address is not usable.
pub fn reply_address_with_token(address: &str, token: &str) -> Option<String> {
    let (local, domain) = address.trim().split_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some(format!("{local}+{token}@{domain}"))
}

/// Token minted by [`reply_address_with_token`], recovered from an inbound
/// recipient address.
pub fn routing_token_from_address(address: &str) -> Option<String> {
    let (local, _domain) = address.trim().split_once('@')?;
    let (_base, token) = local.split_once('+')?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}
