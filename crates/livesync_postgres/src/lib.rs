//! # LiveSync PostgreSQL
//!
//! PostgreSQL backend for the LiveSync change feed.
//!
//! This crate provides:
//! - `LISTEN` connections as a [`livesync_engine::NotificationSource`]
//! - Trigger management as a [`livesync_engine::TriggerStore`]
//! - Install SQL for the bookkeeping schema, the data watch trigger
//!   function and the schema watch event trigger
//! - App registration with a heartbeat and stale trigger cleanup
//!
//! # Bookkeeping schema
//!
//! Every server process registers itself in `<schema>.apps` and records the
//! `(table, condition)` pairs it listens to in `<schema>.app_triggers`.
//! Inserting into `app_triggers` creates statement-level triggers on the
//! watched table; deleting the last row of a table drops them. The triggers
//! evaluate every registered condition against the transition tables and
//! notify each owning app on `<notify_prefix><app_id>` with the positions of
//! the matching conditions.
//!
//! Postgres has no logout hook, so apps heartbeat. Rows of apps that stopped
//! heartbeating are removed by the next app that starts.
//!
//! # Example
//!
//! ```rust,ignore
//! use livesync_postgres::{PgBackend, PgConfig};
//!
//! let config = PgConfig::new("postgres://localhost/app").with_install(true);
//! let backend = PgBackend::connect(config, "app1").await?;
//! let hub = LiveSync::new(db, backend.trigger_store(), engine, listener);
//! backend.start_heartbeat(hub.triggers());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod app;
mod backend;
mod config;
mod error;
mod listener;
mod sql;
mod triggers;

pub use app::{prune, PgApp};
pub use backend::{install, uninstall, PgBackend};
pub use config::{PgConfig, DEFAULT_SCHEMA};
pub use error::{PgError, PgResult};
pub use listener::PgNotificationSource;
pub use sql::{validate_identifier, SqlCatalog, SCHEMA_WATCH_TAGS};
pub use triggers::{list_triggers, AppTrigger, PgTriggerStore};
