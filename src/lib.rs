pub mod auth;
pub mod catalog;
pub mod config;
pub mod data_types;
pub mod engine;
pub mod expr;
pub mod frontend;
pub mod lifecycle;
pub mod metrics;
pub mod policy;
pub mod query;
pub mod realtime;
pub mod repository;
pub mod schema;

pub mod testutils;
