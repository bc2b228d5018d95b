use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::repository::interface::Repository;

/// The database collaborator as seen by the engine: how to reach it and
/// whether it currently answers queries.
#[async_trait]
pub trait DbLifecycle: Send + Sync + Debug {
    /// Must run an actual round trip, not report a cached flag.
    async fn health_check(&self) -> bool;

    fn connection_string(&self) -> String;
}

/// Lifecycle of a database we only connect to (started and stopped by
/// someone else).
#[derive(Debug)]
pub struct ExternalDatabase {
    repository: Arc<dyn Repository>,
    dsn: String,
}

impl ExternalDatabase {
    pub fn new(repository: Arc<dyn Repository>, dsn: &str) -> Self {
        Self {
            repository,
            dsn: dsn.to_string(),
        }
    }
}

#[async_trait]
impl DbLifecycle for ExternalDatabase {
    async fn health_check(&self) -> bool {
        match self.repository.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Database health check failed: {e}");
                false
            }
        }
    }

    fn connection_string(&self) -> String {
        self.dsn.clone()
    }
}
