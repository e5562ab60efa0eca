use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use super::config::ServiceConfig;

/// HTTP Basic check for webhook endpoints. Unconfigured credentials leave
/// the endpoint open; startup already warned about that.
pub(super) fn verify_webhook(headers: &HeaderMap, config: &ServiceConfig) -> Result<(), &'static str> {
    let (Some(username), Some(password)) = (
        config.webhook_username.as_deref(),
        config.webhook_password.as_deref(),
    ) else {
        return Ok(());
    };

    let header = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .ok_or("missing_credentials")?;
    let encoded = header
        .strip_prefix("Basic ")
        .or_else(|| header.strip_prefix("basic "))
        .ok_or("missing_credentials")?;
    let decoded = BASE64_STANDARD
        .decode(encoded.trim().as_bytes())
        .map_err(|_| "invalid_credentials")?;
    let decoded = String::from_utf8(decoded).map_err(|_| "invalid_credentials")?;
    let Some((given_user, given_pass)) = decoded.split_once(':') else {
        return Err("invalid_credentials");
    };
    if given_user != username || given_pass != password {
        return Err("invalid_credentials");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::config::{EmailProviderKind, EmailSettings, ReplyMode};
    use std::time::Duration;

    fn config(username: Option<&str>, password: Option<&str>) -> ServiceConfig {
        ServiceConfig {
            host: "127.0.0.1".to_string(),
            port: 9000,
            database_url: "postgres://localhost/test".to_string(),
            secret_key: "secret".to_string(),
            email: EmailSettings {
                provider: EmailProviderKind::Postmark,
                postmark_server_token: None,
                resend_api_key: None,
                from_address: "hello@example.com".to_string(),
                from_name: "Outreach".to_string(),
                reply_to: None,
            },
            webhook_username: username.map(|value| value.to_string()),
            webhook_password: password.map(|value| value.to_string()),
            worker_poll_interval: Duration::from_secs(5),
            worker_batch_size: 10,
            max_retry_attempts: 3,
            reply_mode: ReplyMode::Webhook,
        }
    }

    fn basic(user: &str, pass: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let encoded = BASE64_STANDARD.encode(format!("{user}:{pass}"));
        headers.insert(
            "authorization",
            format!("Basic {encoded}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn accepts_matching_credentials() {
        let config = config(Some("hook"), Some("s3cret"));
        assert!(verify_webhook(&basic("hook", "s3cret"), &config).is_ok());
    }

    #[test]
    fn rejects_bad_or_missing_credentials() {
        let config = config(Some("hook"), Some("s3cret"));
        assert_eq!(
            verify_webhook(&basic("hook", "wrong"), &config),
            Err("invalid_credentials")
        );
        assert_eq!(
            verify_webhook(&HeaderMap::new(), &config),
            Err("missing_credentials")
        );
    }

    #[test]
    fn open_when_unconfigured() {
        let config = config(None, None);
        assert!(verify_webhook(&HeaderMap::new(), &config).is_ok());
    }
}
