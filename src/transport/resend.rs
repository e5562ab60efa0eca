use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::{
    normalize_message_id, routing_token_from_address, EmailTransport, InboundBounce,
    InboundEmail, OutboundEmail, TransportError,
};

const RESEND_API_BASE_URL: &str = "https://api.resend.com";
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound sends via the Resend HTTP API and parsing of its webhook
/// event envelopes.
pub struct ResendTransport {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
}

impl ResendTransport {
    pub fn new(api_key: String) -> Result<Self, TransportError> {
        Self::with_base_url(api_key, RESEND_API_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Permanent(err.to_string()))?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

impl EmailTransport for ResendTransport {
    fn name(&self) -> &'static str {
        "resend"
    }

    fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        let mut payload = json!({
            "from": email.from,
            "to": [email.to],
            "subject": email.subject,
            "html": email.html_body,
        });
        if let Some(reply_to) = email.reply_to.as_deref() {
            payload["reply_to"] = json!(reply_to);
        }
        if !email.headers.is_empty() {
            let headers: serde_json::Map<String, serde_json::Value> = email
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), json!(value)))
                .collect();
            payload["headers"] = serde_json::Value::Object(headers);
        }

        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|err| {
                error!("resend request error: {}", err);
                TransportError::Transient(format!("http error: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body: ResendErrorResponse = response.json().unwrap_or_default();
            let message = format!(
                "{} (status: {})",
                body.message.unwrap_or_else(|| "unknown error".to_string()),
                status.as_u16()
            );
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(TransportError::Transient(message));
            }
            return Err(TransportError::Permanent(message));
        }

        let body: ResendSendResponse = response
            .json()
            .map_err(|err| TransportError::Transient(format!("invalid resend response: {err}")))?;
        body.id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TransportError::Transient("resend response missing id".to_string()))
    }

    fn parse_inbound(&self, body: &[u8]) -> Result<InboundEmail, TransportError> {
        let event: ResendEvent = serde_json::from_slice(body)
            .map_err(|err| TransportError::Permanent(format!("bad inbound payload: {err}")))?;
        let data = event.data.unwrap_or_default();

        let to = data.to.as_ref().and_then(|list| list.first().cloned());
        let routing_token = to
            .as_deref()
            .and_then(routing_token_from_address);
        let in_reply_to = data
            .headers
            .as_ref()
            .and_then(|headers| headers.get("in-reply-to").or_else(|| headers.get("In-Reply-To")))
            .and_then(|value| normalize_message_id(value));

        Ok(InboundEmail {
            from: data.from,
            to,
            subject: data.subject,
            text_body: data.text,
            message_id: data.email_id,
            in_reply_to,
            references: None,
            routing_token,
        })
    }

    fn parse_bounce(&self, body: &[u8]) -> Result<InboundBounce, TransportError> {
        let event: ResendEvent = serde_json::from_slice(body)
            .map_err(|err| TransportError::Permanent(format!("bad bounce payload: {err}")))?;
        let data = event.data.unwrap_or_default();
        Ok(InboundBounce {
            email: data.to.as_ref().and_then(|list| list.first().cloned()),
            bounce_type: event.event_type,
            description: data.bounce_message,
            message_id: data.email_id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ResendSendResponse {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResendErrorResponse {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResendEvent {
    #[serde(rename = "type")]
    event_type: Option<String>,
    data: Option<ResendEventData>,
}

#[derive(Debug, Default, Deserialize)]
struct ResendEventData {
    email_id: Option<String>,
    from: Option<String>,
    to: Option<Vec<String>>,
    subject: Option<String>,
    text: Option<String>,
    headers: Option<std::collections::HashMap<String, String>>,
    #[serde(rename = "bounce_message")]
    bounce_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_event_maps_routing_token() {
        let transport = ResendTransport::new("key".to_string()).unwrap();
        let body = br#"{
            "type": "email.received",
            "data": {
                "email_id": "evt-1",
                "from": "ada@example.com",
                "to": ["reply+lead-7@outreach.example"],
                "subject": "Re: Hi",
                "text": "interested",
                "headers": {"in-reply-to": "<sent-9@resend>"}
            }
        }"#;
        let inbound = transport.parse_inbound(body).unwrap();
        assert_eq!(inbound.routing_token.as_deref(), Some("lead-7"));
        assert_eq!(inbound.in_reply_to.as_deref(), Some("sent-9@resend"));
    }

    #[test]
    fn bounce_event_maps_fields() {
        let transport = ResendTransport::new("key".to_string()).unwrap();
        let body = br#"{
            "type": "email.bounced",
            "data": {
                "email_id": "sent-3",
                "to": ["gone@example.com"],
                "bounce_message": "mailbox unavailable"
            }
        }"#;
        let bounce = transport.parse_bounce(body).unwrap();
        assert_eq!(bounce.bounce_type.as_deref(), Some("email.bounced"));
        assert_eq!(bounce.message_id.as_deref(), Some("sent-3"));
        assert_eq!(bounce.description.as_deref(), Some("mailbox unavailable"));
    }
}
