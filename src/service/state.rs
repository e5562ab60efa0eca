use std::sync::Arc;

use crate::campaign::lifecycle::CampaignLifecycle;
use crate::campaign::reply::ReplyIngestor;
use crate::campaign::store::pg::PgStore;
use crate::transport::EmailTransport;

use super::config::ServiceConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub store: Arc<PgStore>,
    pub lifecycle: Arc<CampaignLifecycle<PgStore>>,
    pub ingestor: Arc<ReplyIngestor<PgStore>>,
    pub transport: Arc<dyn EmailTransport>,
}
