//! parlsync - legislature open-data synchronization.
//!
//! Discovers published resources from seed listings, detects which of them
//! changed since the last run and imports the changed ones through a durable,
//! lease-based work queue backed by SQLite.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod detection;
pub mod discovery;
pub mod error;
pub mod http_client;
pub mod import;
pub mod models;
pub mod pipeline;
pub mod rate_limit;
pub mod repository;
pub mod retry;
pub mod source;

pub use error::SyncError;
