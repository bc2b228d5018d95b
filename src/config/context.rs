use std::sync::Arc;

#[cfg(feature = "metrics")]
use std::net::SocketAddr;

#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::auth::{Authenticator, StaticTokenAuthenticator};
use crate::catalog::{CatalogError, CatalogHolder};
use crate::engine::RecordsEngine;
use crate::lifecycle::ExternalDatabase;
use crate::query::PageLimits;
use crate::realtime::RealtimeBus;
use crate::repository::{interface::Repository, sqlite::SqliteRepository};

#[cfg(feature = "catalog-postgres")]
use crate::repository::postgres::PostgresRepository;

use super::schema::{self, PetrelConfig};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Error setting up the database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Error loading the catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Invalid metrics listen address {0:?}")]
    MetricsAddress(String),

    #[cfg(feature = "metrics")]
    #[error("Failed to install the metrics exporter: {0}")]
    MetricsExporter(#[from] metrics_exporter_prometheus::BuildError),
}

/// Everything a frontend needs to serve requests.
#[derive(Clone)]
pub struct PetrelContext {
    pub config: PetrelConfig,
    pub engine: RecordsEngine,
    pub authenticator: Arc<dyn Authenticator>,
}

async fn build_repository(config: &schema::Database) -> Result<Arc<dyn Repository>, ContextError> {
    let settings = config.pool_settings();
    let repository: Arc<dyn Repository> = match config {
        #[cfg(feature = "catalog-postgres")]
        schema::Database::Postgres(schema::Postgres {
            dsn,
            schema: schema_name,
            ..
        }) => Arc::new(
            PostgresRepository::try_new(dsn.to_string(), schema_name.to_string(), settings)
                .await?,
        ),
        schema::Database::Sqlite(schema::Sqlite {
            dsn, journal_mode, ..
        }) => Arc::new(
            SqliteRepository::try_new(dsn.to_string(), (*journal_mode).into(), settings).await?,
        ),
    };
    Ok(repository)
}

#[cfg(feature = "metrics")]
pub fn setup_metrics(metrics: &schema::Metrics) -> Result<(), ContextError> {
    let address = format!("{}:{}", metrics.host, metrics.port);
    let addr: SocketAddr = address
        .parse()
        .map_err(|_| ContextError::MetricsAddress(address.clone()))?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    crate::metrics::describe();
    info!("Exporting Prometheus metrics on {addr}");
    Ok(())
}

pub async fn build_engine(config: &PetrelConfig) -> Result<RecordsEngine, ContextError> {
    let repository = build_repository(&config.database).await?;
    let lifecycle = Arc::new(ExternalDatabase::new(
        repository.clone(),
        config.database.dsn(),
    ));

    let catalog =
        CatalogHolder::load(repository.clone(), Arc::new(config.policies.clone())).await?;
    info!(
        tables = ?catalog.snapshot().table_names(),
        "Loaded the table catalog"
    );

    let limits = config
        .frontend
        .http
        .as_ref()
        .map(|http| http.page_limits())
        .unwrap_or_else(PageLimits::default);
    let bus = Arc::new(RealtimeBus::new(config.realtime.queue_capacity));

    Ok(RecordsEngine::new(
        Arc::new(catalog),
        repository,
        lifecycle,
        bus,
        limits,
    ))
}

pub async fn build_context(config: PetrelConfig) -> Result<PetrelContext, ContextError> {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = &config.misc.metrics {
        setup_metrics(metrics)?;
    }

    let engine = build_engine(&config).await?;
    let authenticator = Arc::new(StaticTokenAuthenticator::from_config(&config.auth));

    Ok(PetrelContext {
        config,
        engine,
        authenticator,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::schema::load_config_from_string;

    #[tokio::test]
    async fn test_build_context_sqlite() {
        let dir = TempDir::new().unwrap();
        let config = load_config_from_string(
            &format!(
                r#"
[database]
type = "sqlite"
dsn = "sqlite://{}"
max_connections = 2

[policies.nothing]
default = "open"
"#,
                dir.path().join("petrel.db").display()
            ),
            false,
            None,
        )
        .unwrap();

        let context = build_context(config).await.unwrap();
        assert!(context.engine.health_check().await);
        // Fresh database: only internal tables, which are never exposed
        assert!(context.engine.catalog().snapshot().table_names().is_empty());
        assert!(context
            .engine
            .lifecycle()
            .connection_string()
            .ends_with("petrel.db"));
    }
}
