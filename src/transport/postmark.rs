use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::{
    normalize_message_id, routing_token_from_address, EmailTransport, InboundBounce,
    InboundEmail, OutboundEmail, TransportError,
};

const POSTMARK_API_BASE_URL: &str = "https://api.postmarkapp.com";
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound sends via the Postmark HTTP API and parsing of its inbound and
/// bounce webhook payloads.
pub struct PostmarkTransport {
    client: reqwest::blocking::Client,
    base_url: String,
    server_token: String,
}

impl PostmarkTransport {
    pub fn new(server_token: String) -> Result<Self, TransportError> {
        Self::with_base_url(server_token, POSTMARK_API_BASE_URL.to_string())
    }

    pub fn with_base_url(server_token: String, base_url: String) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Permanent(err.to_string()))?;
        Ok(Self {
            client,
            base_url,
            server_token,
        })
    }
}

impl EmailTransport for PostmarkTransport {
    fn name(&self) -> &'static str {
        "postmark"
    }

    fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        let mut payload = json!({
            "From": email.from,
            "To": email.to,
            "Subject": email.subject,
            "HtmlBody": email.html_body,
            "MessageStream": "outbound",
        });
        if let Some(reply_to) = email.reply_to.as_deref() {
            payload["ReplyTo"] = json!(reply_to);
        }
        if !email.headers.is_empty() {
            let headers: Vec<serde_json::Value> = email
                .headers
                .iter()
                .map(|(name, value)| json!({"Name": name, "Value": value}))
                .collect();
            payload["Headers"] = json!(headers);
        }

        let response = self
            .client
            .post(format!("{}/email", self.base_url))
            .header("Accept", "application/json")
            .header("X-Postmark-Server-Token", &self.server_token)
            .json(&payload)
            .send()
            .map_err(|err| {
                error!("postmark request error: {}", err);
                TransportError::Transient(format!("http error: {err}"))
            })?;

        let status = response.status();
        let body: PostmarkSendResponse = response.json().map_err(|err| {
            TransportError::Transient(format!("invalid postmark response: {err}"))
        })?;

        if !status.is_success() {
            let message = format!(
                "{} (code: {})",
                body.message.unwrap_or_else(|| "unknown error".to_string()),
                body.error_code.unwrap_or(0)
            );
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(TransportError::Transient(message));
            }
            return Err(TransportError::Permanent(message));
        }

        body.message_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                TransportError::Transient("postmark response missing MessageID".to_string())
            })
    }

    fn parse_inbound(&self, body: &[u8]) -> Result<InboundEmail, TransportError> {
        let payload: PostmarkInbound = serde_json::from_slice(body)
            .map_err(|err| TransportError::Permanent(format!("bad inbound payload: {err}")))?;

        let routing_token = payload
            .mailbox_hash
            .clone()
            .filter(|hash| !hash.trim().is_empty())
            .or_else(|| {
                payload
                    .original_recipient()
                    .and_then(|address| routing_token_from_address(address))
            });
        let in_reply_to = payload
            .header_value("In-Reply-To")
            .and_then(normalize_message_id);
        let references = payload
            .header_value("References")
            .map(|value| value.to_string());

        Ok(InboundEmail {
            from: payload.from,
            to: payload.to,
            subject: payload.subject,
            text_body: payload.stripped_text_reply.or(payload.text_body),
            message_id: payload.message_id,
            in_reply_to,
            references,
            routing_token,
        })
    }

    fn parse_bounce(&self, body: &[u8]) -> Result<InboundBounce, TransportError> {
        let payload: PostmarkBounce = serde_json::from_slice(body)
            .map_err(|err| TransportError::Permanent(format!("bad bounce payload: {err}")))?;
        Ok(InboundBounce {
            email: payload.email,
            bounce_type: payload.bounce_type,
            description: payload.description,
            message_id: payload.message_id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PostmarkSendResponse {
    #[serde(rename = "MessageID", alias = "MessageId")]
    message_id: Option<String>,
    #[serde(rename = "ErrorCode")]
    error_code: Option<i64>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostmarkInbound {
    #[serde(rename = "From")]
    from: Option<String>,
    #[serde(rename = "To")]
    to: Option<String>,
    #[serde(rename = "Subject")]
    subject: Option<String>,
    #[serde(rename = "MailboxHash")]
    mailbox_hash: Option<String>,
    #[serde(rename = "TextBody")]
    text_body: Option<String>,
    #[serde(rename = "StrippedTextReply")]
    stripped_text_reply: Option<String>,
    #[serde(rename = "MessageID", alias = "MessageId")]
    message_id: Option<String>,
    #[serde(rename = "OriginalRecipient")]
    original_recipient: Option<String>,
    #[serde(rename = "Headers")]
    headers: Option<Vec<PostmarkHeader>>,
}

impl PostmarkInbound {
    fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.as_ref().and_then(|headers| {
            headers
                .iter()
                .find(|header| header.name.eq_ignore_ascii_case(name))
                .map(|header| header.value.as_str())
        })
    }

    fn original_recipient(&self) -> Option<&str> {
        self.original_recipient
            .as_deref()
            .or(self.to.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct PostmarkHeader {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct PostmarkBounce {
    #[serde(rename = "Type")]
    bounce_type: Option<String>,
    #[serde(rename = "Email")]
    email: Option<String>,
    #[serde(rename = "Description")]
    description: Option<String>,
    #[serde(rename = "MessageID", alias = "MessageId")]
    message_id: Option<String>,
}
