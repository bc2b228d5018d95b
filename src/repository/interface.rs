use std::fmt::Debug;

use async_trait::async_trait;

use crate::data_types::{ColumnType, Record};
use crate::query::BuiltQuery;
use crate::schema::{Column, SqlDialect};

/// One column of a user table, as reported by the database's metadata.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct IntrospectedColumn {
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub has_default: bool,
    /// 1-based position within the primary key, 0 if not part of it
    pub primary_key_position: i64,
    pub ordinal: i64,
}

/// Wrapper for conversion of database-specific error codes into actual errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unique constraint violation: {0}")]
    UniqueConstraintViolation(sqlx::Error),

    #[error("check constraint violation: {0}")]
    CheckConstraintViolation(sqlx::Error),

    #[error("foreign key constraint violation: {0}")]
    FKConstraintViolation(sqlx::Error),

    #[error("not null constraint violation: {0}")]
    NotNullViolation(sqlx::Error),

    // All other errors
    #[error(transparent)]
    SqlxError(sqlx::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[async_trait]
pub trait Repository: Send + Sync + Debug {
    /// Run the internal migrations (the sequence table).
    async fn setup(&self) -> Result<()>;

    /// All columns of all user tables, ordered by table and column position.
    /// Internal tables are excluded.
    async fn introspect(&self) -> Result<Vec<IntrospectedColumn>>;

    /// Map a type name reported by [`Repository::introspect`] onto a column
    /// type; `None` if the type isn't supported.
    fn column_type(&self, data_type: &str) -> Option<ColumnType>;

    fn dialect(&self) -> SqlDialect;

    async fn fetch_records(&self, query: &BuiltQuery, columns: &[Column]) -> Result<Vec<Record>>;

    async fn fetch_count(&self, query: &BuiltQuery) -> Result<i64>;

    async fn begin(&self) -> Result<Box<dyn RepositoryTransaction>>;

    /// Run a trivial query to check that the database is reachable.
    async fn ping(&self) -> Result<()>;
}

/// A transaction holding one pooled connection. Dropping it without
/// committing rolls it back.
#[async_trait]
pub trait RepositoryTransaction: Send {
    async fn fetch_optional_record(
        &mut self,
        query: &BuiltQuery,
        columns: &[Column],
    ) -> Result<Option<Record>>;

    /// Run a query returning a single integer column.
    async fn fetch_optional_scalar(&mut self, query: &BuiltQuery) -> Result<Option<i64>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
