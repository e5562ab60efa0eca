use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::campaign::schedule::DEFAULT_MAX_RETRY_ATTEMPTS;
use crate::transport::{EmailTransport, PostmarkTransport, ResendTransport, TransportError};

use super::BoxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Replies arrive on the inbound webhook.
    Webhook,
    /// Development mode: replies are driven through the mark-replied
    /// endpoint instead.
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailProviderKind {
    Postmark,
    Resend,
}

#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub provider: EmailProviderKind,
    pub postmark_server_token: Option<String>,
    pub resend_api_key: Option<String>,
    pub from_address: String,
    pub from_name: String,
    pub reply_to: Option<String>,
}

impl EmailSettings {
    pub fn build_transport(&self) -> Result<Arc<dyn EmailTransport>, TransportError> {
        match self.provider {
            EmailProviderKind::Postmark => {
                let token = self.postmark_server_token.clone().unwrap_or_default();
                Ok(Arc::new(PostmarkTransport::new(token)?))
            }
            EmailProviderKind::Resend => {
                let key = self.resend_api_key.clone().unwrap_or_default();
                Ok(Arc::new(ResendTransport::new(key)?))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Session-token signing key for the login layer that fronts this
    /// service. Required so a misconfigured deployment fails loudly.
    pub secret_key: String,
    pub email: EmailSettings,
    pub webhook_username: Option<String>,
    pub webhook_password: Option<String>,
    pub worker_poll_interval: Duration,
    pub worker_batch_size: i64,
    pub max_retry_attempts: i32,
    pub reply_mode: ReplyMode,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let host = env::var("SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("SERVICE_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(9000);

        let database_url =
            env_var_non_empty("DATABASE_URL").ok_or("DATABASE_URL is required")?;
        let secret_key = env_var_non_empty("SECRET_KEY").ok_or("SECRET_KEY is required")?;

        let provider = match env::var("EMAIL_PROVIDER")
            .unwrap_or_else(|_| "postmark".to_string())
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "postmark" => EmailProviderKind::Postmark,
            "resend" => EmailProviderKind::Resend,
            other => return Err(format!("unknown EMAIL_PROVIDER: {}", other).into()),
        };

        let postmark_server_token = env_var_non_empty("POSTMARK_SERVER_TOKEN");
        let resend_api_key = env_var_non_empty("RESEND_API_KEY");
        match provider {
            EmailProviderKind::Postmark if postmark_server_token.is_none() => {
                warn!("POSTMARK_SERVER_TOKEN not set; outbound sends will fail until configured");
            }
            EmailProviderKind::Resend if resend_api_key.is_none() => {
                warn!("RESEND_API_KEY not set; outbound sends will fail until configured");
            }
            _ => {}
        }

        let from_address = env_var_non_empty("EMAIL_FROM_ADDRESS").unwrap_or_else(|| {
            warn!("EMAIL_FROM_ADDRESS not set; outbound sends will fail until configured");
            String::new()
        });
        let from_name =
            env_var_non_empty("EMAIL_FROM_NAME").unwrap_or_else(|| "Outreach".to_string());
        let reply_to = env_var_non_empty("EMAIL_REPLY_TO");
        if reply_to.is_none() {
            warn!("EMAIL_REPLY_TO not set; replies cannot be routed by address token");
        }

        let webhook_username = env_var_non_empty("WEBHOOK_USERNAME");
        let webhook_password = env_var_non_empty("WEBHOOK_PASSWORD");
        if webhook_username.is_none() || webhook_password.is_none() {
            warn!("WEBHOOK_USERNAME/WEBHOOK_PASSWORD not set; inbound webhooks are unauthenticated");
        }

        let worker_poll_interval = env::var("WORKER_POLL_INTERVAL_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(5));
        let worker_batch_size = env::var("WORKER_BATCH_SIZE")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(10);
        let max_retry_attempts = env::var("MAX_RETRY_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse::<i32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_RETRY_ATTEMPTS);

        let reply_mode = match env::var("REPLY_MODE")
            .unwrap_or_else(|_| "webhook".to_string())
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "webhook" => ReplyMode::Webhook,
            "simulated" => ReplyMode::Simulated,
            other => return Err(format!("unknown REPLY_MODE: {}", other).into()),
        };

        Ok(Self {
            host,
            port,
            database_url,
            secret_key,
            email: EmailSettings {
                provider,
                postmark_server_token,
                resend_api_key,
                from_address,
                from_name,
                reply_to,
            },
            webhook_username,
            webhook_password,
            worker_poll_interval,
            worker_batch_size,
            max_retry_attempts,
            reply_mode,
        })
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
