//! Fixtures shared by unit tests and the integration tests in `tests/`.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::sqlite::SqliteJournalMode;
use sqlx::Executor;
use tempfile::TempDir;

use crate::auth::{Principal, StaticTokenAuthenticator};
use crate::config::context::{build_engine, PetrelContext};
use crate::config::schema::{
    str_to_hex_hash, AuthConfig, Database, Frontend, JournalMode, Misc, PetrelConfig, Realtime,
    Sqlite, TokenConfig,
};
use crate::data_types::ColumnType;
use crate::engine::{RecordsEngine, RequestContext};
use crate::policy::{CompiledPolicy, TablePolicies, TablePolicyConfig};
use crate::repository::sqlite::SqliteRepository;
use crate::repository::PoolSettings;
use crate::schema::{Column, DefaultAccess, SqlDialect, TableDefinition};

/// Used by the generic repository tests
pub const SQLITE_REPOSITORY_FIXTURE: &str = r#"
CREATE TABLE tags (
    id INTEGER PRIMARY KEY,
    label TEXT NOT NULL UNIQUE,
    weight REAL CHECK (weight >= 0),
    created DATETIME DEFAULT CURRENT_TIMESTAMP
);
"#;

pub const POSTGRES_REPOSITORY_FIXTURE: &str = r#"
CREATE TABLE tags (
    id BIGSERIAL PRIMARY KEY,
    label TEXT NOT NULL UNIQUE,
    weight DOUBLE PRECISION CHECK (weight >= 0),
    created TIMESTAMP WITH TIME ZONE DEFAULT now()
);
"#;

/// The application schema behind the engine, HTTP and scenario tests. The
/// last two tables can't be exposed and are skipped by the catalog.
pub const SQLITE_FIXTURES: &str = r#"
CREATE TABLE polls (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    question TEXT NOT NULL,
    is_closed BOOLEAN NOT NULL DEFAULT FALSE,
    created DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE options (
    id INTEGER PRIMARY KEY,
    poll_id TEXT NOT NULL REFERENCES polls(id),
    label TEXT NOT NULL
);

CREATE TABLE votes (
    id INTEGER PRIMARY KEY,
    poll_id TEXT NOT NULL REFERENCES polls(id),
    option_id INTEGER NOT NULL REFERENCES options(id),
    user_id TEXT NOT NULL,
    UNIQUE (poll_id, user_id)
);

CREATE TABLE notes (
    id INTEGER PRIMARY KEY,
    owner_id TEXT,
    body TEXT,
    score INTEGER,
    is_public BOOLEAN NOT NULL DEFAULT FALSE,
    meta JSON
);

CREATE TABLE attachments (
    id INTEGER PRIMARY KEY,
    content BLOB
);

CREATE TABLE pairs (
    a INTEGER,
    b INTEGER,
    PRIMARY KEY (a, b)
);
"#;

pub const ALICE_TOKEN: &str = "alice-secret-token";
pub const BOB_TOKEN: &str = "bob-secret-token";
pub const ADMIN_TOKEN: &str = "root-secret-token";

/// Columns of the `notes` fixture table, as the catalog sees them.
pub fn notes_columns() -> Vec<Column> {
    vec![
        Column::new("id", ColumnType::Integer, "INTEGER")
            .not_null()
            .with_default(),
        Column::new("owner_id", ColumnType::Text, "TEXT"),
        Column::new("body", ColumnType::Text, "TEXT"),
        Column::new("score", ColumnType::Integer, "INTEGER"),
        Column::new("is_public", ColumnType::Boolean, "BOOLEAN")
            .not_null()
            .with_default(),
        Column::new("meta", ColumnType::Json, "JSON"),
    ]
}

/// `notes` with every operation allowed
pub fn notes_table() -> TableDefinition {
    TableDefinition {
        name: "notes".to_string(),
        columns: notes_columns(),
        primary_key: "id".to_string(),
        default_access: DefaultAccess::Open,
        policies: TablePolicies::uniform(CompiledPolicy::Allow),
        dialect: SqlDialect::Sqlite,
    }
}

pub fn polls_table() -> TableDefinition {
    TableDefinition {
        name: "polls".to_string(),
        columns: vec![
            Column::new("id", ColumnType::Text, "TEXT").not_null(),
            Column::new("owner_id", ColumnType::Text, "TEXT").not_null(),
            Column::new("question", ColumnType::Text, "TEXT").not_null(),
            Column::new("is_closed", ColumnType::Boolean, "BOOLEAN")
                .not_null()
                .with_default(),
            Column::new("created", ColumnType::Timestamp, "DATETIME").with_default(),
        ],
        primary_key: "id".to_string(),
        default_access: DefaultAccess::Open,
        policies: TablePolicies::uniform(CompiledPolicy::Allow),
        dialect: SqlDialect::Sqlite,
    }
}

fn policy(
    read: Option<&str>,
    create: Option<&str>,
    update: Option<&str>,
    delete: Option<&str>,
) -> TablePolicyConfig {
    TablePolicyConfig {
        default: DefaultAccess::Closed,
        create: create.map(String::from),
        read: read.map(String::from),
        update: update.map(String::from),
        delete: delete.map(String::from),
    }
}

/// Row-level security for the fixture tables
pub fn fixture_policies() -> HashMap<String, TablePolicyConfig> {
    let owner = Some("owner_id = principal.id");
    HashMap::from([
        (
            "notes".to_string(),
            policy(
                Some("is_public = true or owner_id = principal.id"),
                owner,
                owner,
                owner,
            ),
        ),
        (
            "polls".to_string(),
            policy(Some("true"), owner, owner, owner),
        ),
        ("options".to_string(), TablePolicyConfig::open()),
        (
            "votes".to_string(),
            // Votes can't be changed, only withdrawn
            policy(
                Some("true"),
                Some("user_id = principal.id"),
                None,
                Some("user_id = principal.id"),
            ),
        ),
    ])
}

pub fn principal(id: &str, role: &str) -> Principal {
    Principal::new(id, role)
}

pub fn context(id: &str, role: &str) -> RequestContext {
    RequestContext::new(principal(id, role))
}

fn sqlite_dsn(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("petrel.db").display())
}

pub async fn make_sqlite_repository() -> (Arc<SqliteRepository>, TempDir) {
    let dir = TempDir::new().unwrap();
    let repository = SqliteRepository::try_new(
        sqlite_dsn(&dir),
        SqliteJournalMode::Wal,
        PoolSettings::default(),
    )
    .await
    .expect("Error setting up the database");
    (Arc::new(repository), dir)
}

fn token(secret: &str, id: &str, role: &str) -> TokenConfig {
    TokenConfig {
        sha256_hash: str_to_hex_hash(secret),
        id: id.to_string(),
        role: role.to_string(),
        claims: HashMap::new(),
    }
}

/// Config for a file-backed SQLite database in `dir`, with the fixture
/// policies and one token each for alice, bob and an admin.
pub fn test_config(dir: &TempDir) -> PetrelConfig {
    PetrelConfig {
        database: Database::Sqlite(Sqlite {
            dsn: sqlite_dsn(dir),
            journal_mode: JournalMode::Wal,
            max_connections: 8,
            acquire_timeout_ms: 5000,
        }),
        frontend: Frontend::default(),
        auth: AuthConfig {
            allow_anonymous: true,
            tokens: vec![
                token(ALICE_TOKEN, "alice", "user"),
                token(BOB_TOKEN, "bob", "user"),
                token(ADMIN_TOKEN, "root", "admin"),
            ],
        },
        realtime: Realtime::default(),
        policies: fixture_policies(),
        misc: Misc::default(),
    }
}

/// Engine over a fresh database loaded with [`SQLITE_FIXTURES`]. Keep the
/// returned directory alive for as long as the engine is used.
pub async fn make_test_engine() -> (RecordsEngine, TempDir) {
    let (context, dir) = make_test_context().await;
    (context.engine, dir)
}

pub async fn make_test_context() -> (PetrelContext, TempDir) {
    let (repository, dir) = make_sqlite_repository().await;
    repository
        .executor
        .execute(SQLITE_FIXTURES)
        .await
        .expect("Error loading the fixtures");
    repository.executor.close().await;

    let config = test_config(&dir);
    let engine = build_engine(&config)
        .await
        .expect("Error building the engine");
    let authenticator = Arc::new(StaticTokenAuthenticator::from_config(&config.auth));

    (
        PetrelContext {
            config,
            engine,
            authenticator,
        },
        dir,
    )
}

/// A driver error with a chosen SQLSTATE/extended code and message, for
/// exercising error classification without a server.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct FakeDatabaseError {
    code: Option<String>,
    message: String,
}

impl FakeDatabaseError {
    pub fn sqlx(code: Option<&str>, message: &str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(Self {
            code: code.map(String::from),
            message: message.to_string(),
        }))
    }
}

impl sqlx::error::DatabaseError for FakeDatabaseError {
    fn message(&self) -> &str {
        &self.message
    }

    fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
        self.code.as_deref().map(std::borrow::Cow::Borrowed)
    }

    fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
        self
    }

    fn kind(&self) -> sqlx::error::ErrorKind {
        sqlx::error::ErrorKind::Other
    }
}
