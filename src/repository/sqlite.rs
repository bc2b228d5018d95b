use std::{fmt::Debug, str::FromStr};

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteArguments, SqliteJournalMode, SqliteRow};
use sqlx::{
    migrate::Migrator,
    query::Query,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite, Transaction,
};
use uuid::Uuid;

use crate::data_types::{parse_timestamp, round_to_millis, ColumnType, Record, Value};
use crate::implement_repository;
use crate::query::{BuiltQuery, SqlParam};
use crate::schema::{Column, SqlDialect};

use super::{
    default::RepositoryQueries,
    interface::{Error, IntrospectedColumn, Repository, RepositoryTransaction, Result},
    PoolSettings,
};

/// Timestamps are stored as text at millisecond precision, which is what
/// SQLite's own date functions resolve.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug)]
pub struct SqliteRepository {
    pub executor: Pool<Sqlite>,
}

pub struct SqliteTransaction {
    inner: Transaction<'static, Sqlite>,
}

impl SqliteRepository {
    pub const MIGRATOR: Migrator = sqlx::migrate!("migrations/sqlite");
    pub const DIALECT: SqlDialect = SqlDialect::Sqlite;
    pub const QUERIES: RepositoryQueries = RepositoryQueries {
        // An INTEGER PRIMARY KEY is an alias for the rowid, so it always
        // has a value even though it's not declared with a default.
        introspect: r#"
        SELECT
            m.name AS table_name,
            p.name AS column_name,
            p.type AS data_type,
            p."notnull" = 0 AS is_nullable,
            (p.dflt_value IS NOT NULL OR (p.pk = 1 AND UPPER(p.type) = 'INTEGER')) AS has_default,
            p.pk AS primary_key_position,
            p.cid AS ordinal
        FROM sqlite_master AS m
        JOIN pragma_table_info(m.name) AS p
        WHERE m.type = 'table'
            AND m.name NOT LIKE 'sqlite\_%' ESCAPE '\'
            AND m.name NOT LIKE '\_petrel\_%' ESCAPE '\'
            AND m.name <> '_sqlx_migrations'
        ORDER BY m.name, p.cid"#,
    };

    pub async fn try_new(
        dsn: String,
        journal_mode: SqliteJournalMode,
        settings: PoolSettings,
    ) -> std::result::Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&dsn)?
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .busy_timeout(settings.acquire_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(options)
            .await?;
        let repo = Self { executor: pool };
        repo.setup().await.map_err(|e| match e {
            Error::SqlxError(e) => e,
            other => sqlx::Error::Protocol(other.to_string()),
        })?;
        Ok(repo)
    }

    pub fn interpret_error(error: sqlx::Error) -> Error {
        if let sqlx::Error::Database(ref d) = error {
            // Reference: https://www.sqlite.org/rescode.html
            let message = d.message();

            // For some reason, sqlx doesn't return the proper errcode for FK violations,
            // even though it's calling sqlite3_extended_errcode which is meant to return full codes.
            if message.contains("FOREIGN KEY constraint failed") {
                return Error::FKConstraintViolation(error);
            }
            if message.contains("UNIQUE constraint failed") {
                return Error::UniqueConstraintViolation(error);
            }
            if message.contains("CHECK constraint failed") {
                return Error::CheckConstraintViolation(error);
            }
            if message.contains("NOT NULL constraint failed") {
                return Error::NotNullViolation(error);
            }
        }
        Error::SqlxError(error)
    }

    /// SQLite column types are free-form; follow its affinity rules loosely
    /// and only accept the declarations we know how to round-trip.
    pub fn column_type(data_type: &str) -> Option<ColumnType> {
        let declared = data_type.trim().to_ascii_uppercase();
        let base = declared.split('(').next().unwrap_or_default().trim();

        match base {
            "INT" | "INTEGER" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "BIGINT" | "INT2"
            | "INT4" | "INT8" | "UNSIGNED BIG INT" => Some(ColumnType::Integer),
            "REAL" | "FLOAT" | "DOUBLE" | "DOUBLE PRECISION" | "NUMERIC" | "DECIMAL" => {
                Some(ColumnType::Real)
            }
            "BOOL" | "BOOLEAN" => Some(ColumnType::Boolean),
            "TIMESTAMP" | "DATETIME" | "DATE" | "TIMESTAMPTZ" => Some(ColumnType::Timestamp),
            "UUID" => Some(ColumnType::Uuid),
            "JSON" | "JSONB" => Some(ColumnType::Json),
            "" | "TEXT" | "CLOB" | "CHAR" | "CHARACTER" | "VARCHAR" | "VARYING CHARACTER"
            | "NCHAR" | "NATIVE CHARACTER" | "NVARCHAR" => Some(ColumnType::Text),
            _ => None,
        }
    }

    fn bind_param<'q>(
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
        param: &SqlParam,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        match &param.value {
            Value::Null => query.bind(None::<String>),
            Value::Text(s) => query.bind(s.clone()),
            Value::Integer(i) => query.bind(*i),
            Value::Real(f) => query.bind(*f),
            Value::Boolean(b) => query.bind(*b),
            Value::Timestamp(ts) => {
                query.bind(round_to_millis(*ts).format(TIMESTAMP_FORMAT).to_string())
            }
            Value::Uuid(u) => query.bind(u.hyphenated().to_string()),
            Value::Json(j) => query.bind(j.to_string()),
        }
    }

    fn build_query(query: &BuiltQuery) -> Query<'_, Sqlite, SqliteArguments<'_>> {
        query
            .params
            .iter()
            .fold(sqlx::query(&query.sql), Self::bind_param)
    }

    fn decode_value(row: &SqliteRow, column: &Column) -> std::result::Result<Value, sqlx::Error> {
        let name = column.name.as_str();
        let invalid = |value: String| sqlx::Error::ColumnDecode {
            index: column.name.clone(),
            source: format!("invalid {} value {value:?}", column.column_type).into(),
        };

        // Declared types aren't enforced by SQLite, so skip sqlx's type
        // compatibility check and decode by the column's semantic type.
        let value = match column.column_type {
            ColumnType::Text => row
                .try_get_unchecked::<Option<String>, _>(name)?
                .map(Value::Text),
            ColumnType::Integer => row
                .try_get_unchecked::<Option<i64>, _>(name)?
                .map(Value::Integer),
            ColumnType::Real => row
                .try_get_unchecked::<Option<f64>, _>(name)?
                .map(Value::Real),
            ColumnType::Boolean => row
                .try_get_unchecked::<Option<bool>, _>(name)?
                .map(Value::Boolean),
            ColumnType::Timestamp => match row.try_get_unchecked::<Option<String>, _>(name)? {
                Some(s) => Some(Value::Timestamp(parse_timestamp(&s).ok_or_else(|| invalid(s))?)),
                None => None,
            },
            ColumnType::Uuid => match row.try_get_unchecked::<Option<String>, _>(name)? {
                Some(s) => Some(Value::Uuid(Uuid::parse_str(&s).map_err(|_| invalid(s))?)),
                None => None,
            },
            ColumnType::Json => match row.try_get_unchecked::<Option<String>, _>(name)? {
                Some(s) => Some(Value::Json(
                    serde_json::from_str(&s).map_err(|_| invalid(s))?,
                )),
                None => None,
            },
        };

        Ok(value.unwrap_or(Value::Null))
    }

    fn decode_record(
        row: &SqliteRow,
        columns: &[Column],
    ) -> std::result::Result<Record, sqlx::Error> {
        columns
            .iter()
            .map(|column| Ok((column.name.clone(), Self::decode_value(row, column)?)))
            .collect()
    }
}

implement_repository!(SqliteRepository, SqliteTransaction);
