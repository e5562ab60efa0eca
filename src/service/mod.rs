use axum::http::StatusCode;
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::campaign::lifecycle::LifecycleError;
use crate::campaign::store::StoreError;

mod auth;
mod campaigns;
pub mod config;
mod jobs;
mod server;
pub mod state;
mod webhooks;

pub use config::{EmailProviderKind, EmailSettings, ReplyMode, ServiceConfig};
pub use server::run_server;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error body shared by every endpoint.
pub(crate) type ApiError = (StatusCode, Json<serde_json::Value>);

pub(crate) fn detail(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "detail": message.into() })))
}

pub(crate) fn internal_error() -> ApiError {
    detail(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

pub(crate) fn lifecycle_error(err: LifecycleError) -> ApiError {
    match err {
        LifecycleError::NotFound(message) => detail(StatusCode::NOT_FOUND, message),
        LifecycleError::InvalidTransition(message) => detail(StatusCode::CONFLICT, message),
        LifecycleError::Validation(message) => detail(StatusCode::BAD_REQUEST, message),
        LifecycleError::Store(err) => store_error(err),
    }
}

pub(crate) fn store_error(err: StoreError) -> ApiError {
    error!("store error: {}", err);
    internal_error()
}

/// Store calls are synchronous; run them off the async runtime.
pub(crate) async fn blocking<T, F>(task: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|err| {
        error!("blocking task failed: {}", err);
        internal_error()
    })
}
