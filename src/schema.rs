use serde::Deserialize;

use crate::data_types::{ColumnType, Operation};
use crate::policy::{CompiledPolicy, TablePolicies};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    /// Type name as reported by the database, used by the repositories to
    /// pick the right decoder.
    pub sql_type: String,
    pub nullable: bool,
    pub has_default: bool,
}

impl Column {
    pub fn new(name: &str, column_type: ColumnType, sql_type: &str) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            sql_type: sql_type.to_string(),
            nullable: true,
            has_default: false,
        }
    }

    pub fn not_null(self) -> Self {
        Self {
            nullable: false,
            ..self
        }
    }

    pub fn with_default(self) -> Self {
        Self {
            has_default: true,
            ..self
        }
    }

    /// Whether a create payload may leave this column out.
    pub fn is_optional(&self) -> bool {
        self.nullable || self.has_default
    }
}

/// What a table allows for operations that have no explicit policy.
/// Newly introspected tables without any configuration are `Closed`.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAccess {
    Open,
    #[default]
    Closed,
}

/// The SQL flavour of the database a table lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqlDialect {
    #[default]
    Postgres,
    /// Stores timestamps as text, so comparing them needs normalising.
    Sqlite,
}

/// Immutable description of a table. A catalog refresh builds new
/// definitions; existing ones are never mutated.
#[derive(Debug, Clone)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: String,
    pub default_access: DefaultAccess,
    pub policies: TablePolicies,
    pub dialect: SqlDialect,
}

impl TableDefinition {
    pub fn column(&self, name: &str) -> Option<&Column> {
        find_column(&self.columns, name)
    }

    pub fn primary_key_column(&self) -> &Column {
        // Catalog construction guarantees the primary key is one of the columns
        self.column(&self.primary_key)
            .unwrap_or_else(|| &self.columns[0])
    }

    pub fn policy(&self, operation: Operation) -> &CompiledPolicy {
        self.policies.get(operation)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

pub fn find_column<'a>(columns: &'a [Column], name: &str) -> Option<&'a Column> {
    columns.iter().find(|c| c.name == name)
}

/// Quote an identifier for inclusion in SQL text. Only ever applied to names
/// that come from the catalog, never to client input.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
