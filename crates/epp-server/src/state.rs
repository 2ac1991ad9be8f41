use std::sync::Arc;

use epp_scheduler::{RequestClassifier, Scheduler};

use crate::health::Readiness;
use crate::metrics::Metrics;
use crate::session::SessionConfig;

#[derive(Clone)]
pub struct AppState {
    pub pool_name: String,
    pub scheduler: Arc<Scheduler>,
    pub classifier: Arc<RequestClassifier>,
    pub session: SessionConfig,
    pub metrics: Arc<Metrics>,
    pub readiness: Arc<Readiness>,
}
