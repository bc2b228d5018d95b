use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::TryStreamExt;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::types::Json;
use sqlx::{
    migrate::{MigrateDatabase, Migrator},
    postgres::PgPoolOptions,
    query::Query,
    Executor, PgPool, Postgres, Row, Transaction,
};
use tracing::{error, info};
use uuid::Uuid;

use crate::data_types::{ColumnType, Record, Value};
use crate::implement_repository;
use crate::query::{BuiltQuery, SqlParam};
use crate::schema::{quote_identifier, Column, SqlDialect};

use super::{
    default::RepositoryQueries,
    interface::{Error, IntrospectedColumn, Repository, RepositoryTransaction, Result},
    PoolSettings,
};

#[derive(Debug)]
pub struct PostgresRepository {
    pub executor: PgPool,
    pub schema_name: String,
}

pub struct PostgresTransaction {
    inner: Transaction<'static, Postgres>,
}

impl PostgresRepository {
    pub const MIGRATOR: Migrator = sqlx::migrate!("migrations/postgres");
    pub const DIALECT: SqlDialect = SqlDialect::Postgres;
    pub const QUERIES: RepositoryQueries = RepositoryQueries {
        introspect: r#"
        SELECT
            c.table_name::text AS table_name,
            c.column_name::text AS column_name,
            c.data_type::text AS data_type,
            c.is_nullable = 'YES' AS is_nullable,
            (c.column_default IS NOT NULL OR c.is_identity = 'YES') AS has_default,
            COALESCE(k.ordinal_position, 0)::int8 AS primary_key_position,
            c.ordinal_position::int8 AS ordinal
        FROM information_schema.columns c
        JOIN information_schema.tables t
            ON t.table_schema = c.table_schema
            AND t.table_name = c.table_name
            AND t.table_type = 'BASE TABLE'
        LEFT JOIN information_schema.table_constraints tc
            ON tc.table_schema = c.table_schema
            AND tc.table_name = c.table_name
            AND tc.constraint_type = 'PRIMARY KEY'
        LEFT JOIN information_schema.key_column_usage k
            ON k.constraint_schema = tc.constraint_schema
            AND k.constraint_name = tc.constraint_name
            AND k.table_name = c.table_name
            AND k.column_name = c.column_name
        WHERE c.table_schema = current_schema()
            AND c.table_name NOT LIKE '\_petrel\_%'
            AND c.table_name <> '_sqlx_migrations'
        ORDER BY c.table_name, c.ordinal_position"#,
    };

    pub async fn try_new(
        dsn: String,
        schema_name: String,
        settings: PoolSettings,
    ) -> std::result::Result<Self, sqlx::Error> {
        if !Postgres::database_exists(&dsn).await? {
            match Postgres::create_database(&dsn).await {
                Ok(()) => info!("Created the database"),
                // Lost a race with another instance creating it
                Err(e) if is_duplicate_database(&e) => {}
                Err(e) => {
                    error!("Couldn't create the database: {e}");
                    return Err(e);
                }
            }
        }

        let repo = PostgresRepository::connect(dsn, schema_name.clone(), settings).await?;

        repo.executor
            .execute(
                format!(
                    "CREATE SCHEMA IF NOT EXISTS {};",
                    quote_identifier(&schema_name)
                )
                .as_str(),
            )
            .await?;

        // Setup the schema
        repo.setup().await.map_err(|e| match e {
            Error::SqlxError(e) => e,
            other => sqlx::Error::Protocol(other.to_string()),
        })?;
        Ok(repo)
    }

    pub async fn connect(
        dsn: String,
        schema_name: String,
        settings: PoolSettings,
    ) -> std::result::Result<Self, sqlx::Error> {
        let schema_name_2 = schema_name.clone();

        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .test_before_acquire(true)
            .after_connect(move |c, _m| {
                let schema_name = schema_name.to_owned();
                Box::pin(async move {
                    let query =
                        format!("SET search_path TO {},public;", quote_identifier(&schema_name));
                    c.execute(sqlx::query(&query)).await?;
                    Ok(())
                })
            })
            .connect(&dsn)
            .await?;

        Ok(Self {
            executor: pool,
            schema_name: schema_name_2,
        })
    }

    pub fn interpret_error(error: sqlx::Error) -> Error {
        if let sqlx::Error::Database(ref d) = error {
            // Reference: https://www.postgresql.org/docs/current/errcodes-appendix.html
            if let Some(code) = d.code() {
                match code.as_ref() {
                    "23505" => return Error::UniqueConstraintViolation(error),
                    "23514" => return Error::CheckConstraintViolation(error),
                    "23503" => return Error::FKConstraintViolation(error),
                    "23502" => return Error::NotNullViolation(error),
                    _ => {}
                }
            }
        }
        Error::SqlxError(error)
    }

    /// Maps `information_schema.columns.data_type`.
    pub fn column_type(data_type: &str) -> Option<ColumnType> {
        match data_type {
            "smallint" | "integer" | "bigint" => Some(ColumnType::Integer),
            "real" | "double precision" => Some(ColumnType::Real),
            "boolean" => Some(ColumnType::Boolean),
            "timestamp with time zone" | "timestamp without time zone" | "date" => {
                Some(ColumnType::Timestamp)
            }
            "uuid" => Some(ColumnType::Uuid),
            "json" | "jsonb" => Some(ColumnType::Json),
            "text" | "character varying" | "character" | "name" => Some(ColumnType::Text),
            _ => None,
        }
    }

    /// NULLs are bound with the type of the value they stand in for, so
    /// that Postgres can infer the parameter type.
    fn bind_param<'q>(
        query: Query<'q, Postgres, PgArguments>,
        param: &SqlParam,
    ) -> Query<'q, Postgres, PgArguments> {
        match (&param.value, param.value_type) {
            (Value::Null, ColumnType::Text) => query.bind(None::<String>),
            (Value::Null, ColumnType::Integer) => query.bind(None::<i64>),
            (Value::Null, ColumnType::Real) => query.bind(None::<f64>),
            (Value::Null, ColumnType::Boolean) => query.bind(None::<bool>),
            (Value::Null, ColumnType::Timestamp) => query.bind(None::<DateTime<Utc>>),
            (Value::Null, ColumnType::Uuid) => query.bind(None::<Uuid>),
            (Value::Null, ColumnType::Json) => query.bind(None::<Json<JsonValue>>),
            (Value::Text(s), _) => query.bind(s.clone()),
            (Value::Integer(i), _) => query.bind(*i),
            (Value::Real(f), _) => query.bind(*f),
            (Value::Boolean(b), _) => query.bind(*b),
            (Value::Timestamp(ts), _) => query.bind(*ts),
            (Value::Uuid(u), _) => query.bind(*u),
            (Value::Json(j), _) => query.bind(Json(j.clone())),
        }
    }

    fn build_query(query: &BuiltQuery) -> Query<'_, Postgres, PgArguments> {
        query
            .params
            .iter()
            .fold(sqlx::query(&query.sql), Self::bind_param)
    }

    fn decode_value(row: &PgRow, column: &Column) -> std::result::Result<Value, sqlx::Error> {
        let name = column.name.as_str();

        let value = match column.sql_type.as_str() {
            "smallint" => row.try_get::<Option<i16>, _>(name)?.map(|v| Value::Integer(v.into())),
            "integer" => row.try_get::<Option<i32>, _>(name)?.map(|v| Value::Integer(v.into())),
            "bigint" => row.try_get::<Option<i64>, _>(name)?.map(Value::Integer),
            "real" => row.try_get::<Option<f32>, _>(name)?.map(|v| Value::Real(v.into())),
            "double precision" => row.try_get::<Option<f64>, _>(name)?.map(Value::Real),
            "boolean" => row.try_get::<Option<bool>, _>(name)?.map(Value::Boolean),
            "timestamp with time zone" => row
                .try_get::<Option<DateTime<Utc>>, _>(name)?
                .map(Value::Timestamp),
            "timestamp without time zone" => row
                .try_get::<Option<NaiveDateTime>, _>(name)?
                .map(|ts| Value::Timestamp(ts.and_utc())),
            "date" => row
                .try_get::<Option<NaiveDate>, _>(name)?
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|ts| Value::Timestamp(ts.and_utc())),
            "uuid" => row.try_get::<Option<Uuid>, _>(name)?.map(Value::Uuid),
            "json" | "jsonb" => row.try_get::<Option<JsonValue>, _>(name)?.map(Value::Json),
            _ => row.try_get::<Option<String>, _>(name)?.map(Value::Text),
        };

        Ok(value.unwrap_or(Value::Null))
    }

    fn decode_record(row: &PgRow, columns: &[Column]) -> std::result::Result<Record, sqlx::Error> {
        columns
            .iter()
            .map(|column| Ok((column.name.clone(), Self::decode_value(row, column)?)))
            .collect()
    }
}

/// SQLSTATE 42P04, duplicate_database
fn is_duplicate_database(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(d) if d.code().as_deref() == Some("42P04"))
}

implement_repository!(PostgresRepository, PostgresTransaction);

pub mod testutils {
    use rand::Rng;

    use super::PostgresRepository;
    use crate::repository::PoolSettings;

    pub fn get_random_schema() -> String {
        // Generate a random schema (taken from IOx)
        let mut rng = rand::thread_rng();
        (&mut rng)
            .sample_iter(rand::distributions::Alphanumeric)
            .filter(|c| c.is_ascii_alphabetic())
            .take(20)
            .map(char::from)
            .collect::<String>()
            .to_ascii_lowercase()
    }

    pub async fn make_repository(dsn: &str) -> PostgresRepository {
        let schema_name = get_random_schema();

        PostgresRepository::try_new(dsn.to_string(), schema_name, PoolSettings::default())
            .await
            .expect("Error setting up the database")
    }
}
