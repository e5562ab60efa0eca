use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::task;
use tracing::info;

use crate::campaign::dispatcher::{start_dispatcher, Dispatcher, DispatcherSettings};
use crate::campaign::lifecycle::CampaignLifecycle;
use crate::campaign::reply::ReplyIngestor;
use crate::campaign::store::pg::PgStore;
use crate::clock::{Clock, SystemClock};

use super::config::ServiceConfig;
use super::state::AppState;
use super::{campaigns, jobs, webhooks, BoxError};

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let config = Arc::new(config);

    let database_url = config.database_url.clone();
    let store = Arc::new(
        task::spawn_blocking(move || PgStore::connect(&database_url))
            .await
            .map_err(|err| -> BoxError { err.into() })??,
    );
    // The blocking HTTP client is built off the async runtime.
    let email_settings = config.email.clone();
    let transport = task::spawn_blocking(move || email_settings.build_transport())
        .await
        .map_err(|err| -> BoxError { err.into() })??;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let lifecycle = Arc::new(CampaignLifecycle::new(store.clone(), clock.clone()));
    let ingestor = Arc::new(ReplyIngestor::new(store.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        transport.clone(),
        clock,
        DispatcherSettings {
            poll_interval: config.worker_poll_interval,
            batch_size: config.worker_batch_size,
            max_attempts: config.max_retry_attempts,
            from_address: config.email.from_address.clone(),
            from_name: config.email.from_name.clone(),
            reply_to: config.email.reply_to.clone(),
        },
    ));
    let mut dispatcher_control = start_dispatcher(dispatcher, 1);

    let state = AppState {
        config: config.clone(),
        store,
        lifecycle,
        ingestor,
        transport,
    };
    let app = router(state);

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("campaign service listening on {}", addr);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    dispatcher_control.stop_and_join();
    serve_result?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/users", post(campaigns::create_user))
        .route("/campaigns", post(campaigns::create_campaign))
        .route("/campaigns/{id}", get(campaigns::get_campaign))
        .route("/campaigns/{id}", delete(campaigns::delete))
        .route("/campaigns/{id}/launch", post(campaigns::launch))
        .route("/campaigns/{id}/pause", post(campaigns::pause))
        .route("/campaigns/{id}/resume", post(campaigns::resume))
        .route("/campaigns/{id}/duplicate", post(campaigns::duplicate))
        .route("/campaigns/{id}/next-send", get(campaigns::next_send))
        .route("/campaigns/{id}/send-now", post(campaigns::send_now))
        .route("/campaigns/{id}/step-summary", get(campaigns::step_summary))
        .route("/campaigns/{id}/retry-failed", post(campaigns::retry_failed))
        .route("/campaigns/{id}/failed-jobs", get(campaigns::failed_jobs))
        .route("/campaigns/{id}/leads", post(campaigns::create_lead))
        .route("/campaigns/{id}/leads", get(campaigns::list_leads))
        .route("/campaigns/{id}/templates", post(campaigns::upsert_template))
        .route("/campaigns/{id}/templates", get(campaigns::list_templates))
        .route(
            "/campaigns/{id}/leads/{lead_id}/email-history",
            get(campaigns::email_history),
        )
        .route(
            "/campaigns/{id}/leads/{lead_id}/mark-replied",
            post(campaigns::mark_replied),
        )
        .route("/campaigns/{id}/tags", post(campaigns::add_tag))
        .route("/campaigns/{id}/tags/{tag}", delete(campaigns::remove_tag))
        .route("/jobs/{id}/retry", post(jobs::retry_job))
        .route("/webhooks/inbound", post(webhooks::inbound))
        .route("/webhooks/bounce", post(webhooks::bounce))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
