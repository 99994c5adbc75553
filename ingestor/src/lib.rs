//! Ingestion, validation and storage of smart energy meter telemetry.
//!
//! [`IngestService`] validates raw device submissions and persists them in a
//! SQLite-backed [`Store`]; the [`rest`] module exposes both over HTTP.

pub mod config;
pub mod db;
pub mod errors;
pub mod export;
pub mod ingest;
pub mod maintenance;
pub mod metrics;
pub mod model;
pub mod rate_limit;
pub mod rest;
pub mod validate;

pub use db::Store;
pub use errors::{Error, Result};
pub use ingest::IngestService;
pub use model::{DeviceStatus, Reading, ReadingFilter, Statistics, SubmitOutcome};
pub use validate::ValidationError;
