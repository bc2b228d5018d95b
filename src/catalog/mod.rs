//! The schema catalog: a typed description of every exposed table, built
//! from the database's own metadata plus the configured policies.

mod holder;

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use tracing::{error, warn};

use crate::data_types::ColumnType;
use crate::policy::{PolicyError, PolicySource, TablePolicies};
use crate::repository::interface::{Error as RepositoryError, IntrospectedColumn};
use crate::schema::{Column, SqlDialect, TableDefinition};

pub use holder::CatalogHolder;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Table {name:?} doesn't exist")]
    TableDoesNotExist { name: String },

    #[error("Table {name:?} is unavailable: {reason}")]
    TableUnusable { name: String, reason: PolicyError },

    #[error("Failed to introspect the database: {0}")]
    IntrospectionError(#[from] RepositoryError),
}

pub type CatalogResult<T, E = CatalogError> = Result<T, E>;

#[derive(Debug, Clone)]
pub enum TableEntry {
    Ready(Arc<TableDefinition>),
    /// The table exists but one of its policies doesn't compile. It stays
    /// unusable until the policy is fixed and the catalog refreshed.
    Unusable(PolicyError),
}

/// An immutable snapshot of the exposed tables.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: HashMap<String, TableEntry>,
    version: u64,
}

impl Catalog {
    /// Build a catalog from introspected columns (ordered by table and
    /// column position). Tables we can't expose faithfully are skipped with
    /// a warning.
    pub fn build(
        columns: Vec<IntrospectedColumn>,
        column_type: impl Fn(&str) -> Option<ColumnType>,
        policies: &dyn PolicySource,
        dialect: SqlDialect,
        version: u64,
    ) -> Self {
        let mut tables = HashMap::new();

        for (table_name, table_columns) in &columns.iter().chunk_by(|c| &c.table_name) {
            let table_columns = table_columns.collect_vec();

            let Some(definition_columns) = table_columns
                .iter()
                .map(|c| {
                    let Some(ty) = column_type(&c.data_type) else {
                        warn!(
                            table = table_name.as_str(),
                            column = c.column_name.as_str(),
                            data_type = c.data_type.as_str(),
                            "Skipping table with unsupported column type"
                        );
                        return None;
                    };
                    let mut column = Column::new(&c.column_name, ty, &c.data_type);
                    column.nullable = c.is_nullable;
                    column.has_default = c.has_default;
                    Some(column)
                })
                .collect::<Option<Vec<_>>>()
            else {
                continue;
            };

            let primary_key = match table_columns
                .iter()
                .filter(|c| c.primary_key_position > 0)
                .collect_vec()
                .as_slice()
            {
                [pk] => pk.column_name.clone(),
                other => {
                    warn!(
                        table = table_name.as_str(),
                        primary_key_columns = other.len(),
                        "Skipping table without a single-column primary key"
                    );
                    continue;
                }
            };

            let config = policies.table_policy(table_name).unwrap_or_default();
            let entry = match TablePolicies::compile(table_name, &definition_columns, &config) {
                Ok(compiled) => TableEntry::Ready(Arc::new(TableDefinition {
                    name: table_name.clone(),
                    columns: definition_columns,
                    primary_key,
                    default_access: config.default,
                    policies: compiled,
                    dialect,
                })),
                Err(e) => {
                    error!(table = table_name.as_str(), "{e}");
                    TableEntry::Unusable(e)
                }
            };
            tables.insert(table_name.clone(), entry);
        }

        Self { tables, version }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn lookup(&self, name: &str) -> CatalogResult<Arc<TableDefinition>> {
        match self.tables.get(name) {
            Some(TableEntry::Ready(table)) => Ok(table.clone()),
            Some(TableEntry::Unusable(reason)) => Err(CatalogError::TableUnusable {
                name: name.to_string(),
                reason: reason.clone(),
            }),
            None => Err(CatalogError::TableDoesNotExist {
                name: name.to_string(),
            }),
        }
    }

    /// Names of the usable tables, sorted.
    pub fn table_names(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(_, entry)| matches!(entry, TableEntry::Ready(_)))
            .map(|(name, _)| name.clone())
            .sorted()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::data_types::Operation;
    use crate::policy::{CompiledPolicy, TablePolicyConfig};
    use crate::repository::sqlite::SqliteRepository;

    fn column(table: &str, name: &str, data_type: &str, pk: i64) -> IntrospectedColumn {
        IntrospectedColumn {
            table_name: table.to_string(),
            column_name: name.to_string(),
            data_type: data_type.to_string(),
            is_nullable: pk == 0,
            has_default: false,
            primary_key_position: pk,
            ordinal: 0,
        }
    }

    fn introspected() -> Vec<IntrospectedColumn> {
        vec![
            column("attachments", "id", "INTEGER", 1),
            column("attachments", "data", "BLOB", 0),
            column("notes", "id", "INTEGER", 1),
            column("notes", "owner_id", "TEXT", 0),
            column("notes", "is_public", "BOOLEAN", 0),
            column("pairs", "a", "INTEGER", 1),
            column("pairs", "b", "INTEGER", 2),
            column("plain", "value", "TEXT", 0),
            column("tasks", "id", "TEXT", 1),
            column("tasks", "owner_id", "TEXT", 0),
        ]
    }

    fn build(policies: HashMap<String, TablePolicyConfig>) -> Catalog {
        Catalog::build(
            introspected(),
            SqliteRepository::column_type,
            &policies,
            SqlDialect::Sqlite,
            1,
        )
    }

    #[test]
    fn test_build_skips_unsupported_tables() {
        let catalog = build(HashMap::new());
        assert_eq!(catalog.table_names(), vec!["notes", "tasks"]);

        for missing in ["attachments", "pairs", "plain", "nope"] {
            assert!(matches!(
                catalog.lookup(missing),
                Err(CatalogError::TableDoesNotExist { .. })
            ));
        }

        let notes = catalog.lookup("notes").unwrap();
        assert_eq!(notes.primary_key, "id");
        assert_eq!(notes.column("is_public").unwrap().column_type, ColumnType::Boolean);
        assert!(notes.column("owner_id").unwrap().nullable);
    }

    #[test]
    fn test_tables_without_policies_are_closed() {
        let catalog = build(HashMap::new());
        let notes = catalog.lookup("notes").unwrap();
        for operation in Operation::ALL {
            assert_eq!(notes.policy(operation), &CompiledPolicy::Deny);
        }
    }

    #[test]
    fn test_broken_policy_only_affects_its_table() {
        let catalog = build(HashMap::from([
            (
                "notes".to_string(),
                TablePolicyConfig {
                    read: Some("owner_id = = principal.id".to_string()),
                    ..TablePolicyConfig::open()
                },
            ),
            ("tasks".to_string(), TablePolicyConfig::open()),
        ]));

        match catalog.lookup("notes") {
            Err(CatalogError::TableUnusable { name, reason }) => {
                assert_eq!(name, "notes");
                assert_eq!(reason.operation, Operation::Read);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(catalog.table_names(), vec!["tasks"]);

        let tasks = catalog.lookup("tasks").unwrap();
        assert_eq!(tasks.policy(Operation::Update), &CompiledPolicy::Allow);
    }
}
