/// Default implementation for a Repository that factors out common
/// query patterns between Postgres and SQLite.
///
/// Usage:
///
/// The repository struct has to have an `executor` field holding the pool,
/// and the transaction struct an `inner` field holding the
/// `sqlx::Transaction`:
///
/// ```ignore
/// pub struct MyRepository {
///     pub executor: sqlx::Pool<sqlx::SqlxDatabaseType>
/// }
///
/// pub struct MyTransaction {
///     inner: sqlx::Transaction<'static, sqlx::SqlxDatabaseType>
/// }
///
/// impl MyRepository {
///     pub const MIGRATOR: sqlx::Migrator = sqlx::migrate!("my/migrations");
///     pub const DIALECT: SqlDialect = SqlDialect::...;
///     pub const QUERIES: RepositoryQueries = RepositoryQueries {
///         introspect: "SELECT ...",
///     }
///     pub fn interpret_error(error: sqlx::Error) -> Error { ... }
///     pub fn column_type(data_type: &str) -> Option<ColumnType> { ... }
///     fn build_query(query: &BuiltQuery) -> sqlx::query::Query<...> { ... }
///     fn decode_record(row: &Row, columns: &[Column]) -> Result<Record, sqlx::Error> { ... }
/// }
///
/// implement_repository!(MyRepository, MyTransaction)
/// ```
///
/// The statements themselves are built by the query module with `$n`
/// placeholders, which both backends accept. What differs per backend is
/// how values are bound and decoded, and the metadata query.

/// Queries that are different between SQLite and PG
pub struct RepositoryQueries {
    pub introspect: &'static str,
}

#[macro_export]
macro_rules! implement_repository {
    ($repo: ident, $tx: ident) => {
#[async_trait]
impl Repository for $repo {
    async fn setup(&self) -> Result<(), Error> {
        $repo::MIGRATOR
            .run(&self.executor)
            .await
            .map_err(|e| $repo::interpret_error(e.into()))?;
        Ok(())
    }

    async fn introspect(&self) -> Result<Vec<IntrospectedColumn>, Error> {
        let columns = sqlx::query_as::<_, IntrospectedColumn>($repo::QUERIES.introspect)
            .fetch(&self.executor)
            .try_collect()
            .await
            .map_err($repo::interpret_error)?;

        Ok(columns)
    }

    fn column_type(&self, data_type: &str) -> Option<ColumnType> {
        $repo::column_type(data_type)
    }

    fn dialect(&self) -> SqlDialect {
        $repo::DIALECT
    }

    async fn fetch_records(
        &self,
        query: &BuiltQuery,
        columns: &[Column],
    ) -> Result<Vec<Record>, Error> {
        let rows = $repo::build_query(query)
            .fetch_all(&self.executor)
            .await
            .map_err($repo::interpret_error)?;

        rows.iter()
            .map(|row| $repo::decode_record(row, columns))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err($repo::interpret_error)
    }

    async fn fetch_count(&self, query: &BuiltQuery) -> Result<i64, Error> {
        let count: i64 = $repo::build_query(query)
            .fetch_one(&self.executor)
            .await
            .map_err($repo::interpret_error)?
            .try_get(0)
            .map_err($repo::interpret_error)?;

        Ok(count)
    }

    async fn begin(&self) -> Result<Box<dyn RepositoryTransaction>, Error> {
        let inner = self.executor.begin().await.map_err($repo::interpret_error)?;
        Ok(Box::new($tx { inner }))
    }

    async fn ping(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1")
            .execute(&self.executor)
            .await
            .map_err($repo::interpret_error)?;
        Ok(())
    }
}

#[async_trait]
impl RepositoryTransaction for $tx {
    async fn fetch_optional_record(
        &mut self,
        query: &BuiltQuery,
        columns: &[Column],
    ) -> Result<Option<Record>, Error> {
        let row = $repo::build_query(query)
            .fetch_optional(&mut *self.inner)
            .await
            .map_err($repo::interpret_error)?;

        row.map(|row| $repo::decode_record(&row, columns))
            .transpose()
            .map_err($repo::interpret_error)
    }

    async fn fetch_optional_scalar(&mut self, query: &BuiltQuery) -> Result<Option<i64>, Error> {
        let row = $repo::build_query(query)
            .fetch_optional(&mut *self.inner)
            .await
            .map_err($repo::interpret_error)?;

        row.map(|row| row.try_get::<i64, _>(0))
            .transpose()
            .map_err($repo::interpret_error)
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        self.inner.commit().await.map_err($repo::interpret_error)
    }

    async fn rollback(self: Box<Self>) -> Result<(), Error> {
        self.inner.rollback().await.map_err($repo::interpret_error)
    }
}
    };
}
