use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::{Catalog, CatalogResult};
use crate::policy::PolicySource;
use crate::repository::interface::Repository;
use crate::schema::TableDefinition;

/// Process-wide holder of the current [`Catalog`]. Readers clone the `Arc`
/// and keep using that snapshot for the rest of their request; a refresh
/// builds a new catalog off to the side and swaps the pointer.
#[derive(Debug)]
pub struct CatalogHolder {
    repository: Arc<dyn Repository>,
    policies: Arc<dyn PolicySource>,
    current: RwLock<Arc<Catalog>>,
    next_version: AtomicU64,
}

impl CatalogHolder {
    /// Introspect the database and compile all policies. Fails if the
    /// database metadata can't be read.
    pub async fn load(
        repository: Arc<dyn Repository>,
        policies: Arc<dyn PolicySource>,
    ) -> CatalogResult<Self> {
        let holder = Self {
            repository,
            policies,
            current: RwLock::new(Arc::new(Catalog::default())),
            next_version: AtomicU64::new(1),
        };
        holder.refresh().await?;
        Ok(holder)
    }

    pub fn snapshot(&self) -> Arc<Catalog> {
        self.current.read().clone()
    }

    pub fn lookup(&self, name: &str) -> CatalogResult<Arc<TableDefinition>> {
        self.snapshot().lookup(name)
    }

    /// Rebuild the catalog from the database. On failure the previous
    /// catalog stays in place.
    pub async fn refresh(&self) -> CatalogResult<Arc<Catalog>> {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let columns = self.repository.introspect().await?;

        let repository = self.repository.clone();
        let catalog = Arc::new(Catalog::build(
            columns,
            |data_type| repository.column_type(data_type),
            self.policies.as_ref(),
            self.repository.dialect(),
            version,
        ));

        // Two concurrent refreshes may finish out of order; never replace
        // a catalog with an older introspection.
        let mut current = self.current.write();
        if current.version() < catalog.version() {
            *current = catalog.clone();
            info!(
                version,
                tables = ?catalog.table_names(),
                "Loaded schema catalog"
            );
        }
        Ok(current.clone())
    }
}
