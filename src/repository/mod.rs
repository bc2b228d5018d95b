//! Statement execution against the backing database.

use std::time::Duration;

pub mod default;
pub mod interface;
#[cfg(feature = "catalog-postgres")]
pub mod postgres;
pub mod sqlite;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    /// How long to wait for a free pooled connection (and, on SQLite, for a
    /// database lock) before giving up.
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 16,
            acquire_timeout: Duration::from_millis(5000),
        }
    }
}
