use std::sync::Arc;

use crate::services::broker::ProgressStore;
use crate::services::intake::Intake;
use crate::services::queue::RedisBroker;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<Intake>,
    pub progress: Arc<dyn ProgressStore>,
    pub broker: Arc<RedisBroker>,
}

impl AppState {
    pub fn new(intake: Intake, broker: Arc<RedisBroker>) -> Self {
        Self {
            intake: Arc::new(intake),
            progress: broker.clone(),
            broker,
        }
    }
}
