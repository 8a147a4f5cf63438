//! tourdesk-core - Core library for tourdesk
//!
//! Ledger models and storage for booking requests, operator costs and
//! revenues, the three-tier lock rules, and the engine that mirrors committed
//! changes into the accounting spreadsheet through a durable queue.

pub mod capture;
pub mod config;
pub mod db;
pub mod error;
pub mod ids;
pub mod lock;
pub mod models;
pub mod queue;
pub mod services;
pub mod sheets;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{EntityKind, EntityRecord, SyncTask, TaskId};
