use sqlx::PgPool;
use std::sync::Arc;

use crate::db::store::{JobStore, PgJobStore};
use crate::services::{
    queue::{JobPublisher, JobQueue},
    storage::ArtifactStore,
    submission::DirectivePolicy,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<JobQueue>,
    pub store: Arc<dyn JobStore>,
    pub publisher: Arc<dyn JobPublisher>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub directive_policy: DirectivePolicy,
}

impl AppState {
    pub fn new(
        db: PgPool,
        queue: JobQueue,
        artifacts: Arc<dyn ArtifactStore>,
        directive_policy: DirectivePolicy,
    ) -> Self {
        let queue = Arc::new(queue);
        Self {
            store: Arc::new(PgJobStore::new(db.clone())),
            publisher: queue.clone(),
            db,
            queue,
            artifacts,
            directive_policy,
        }
    }
}
