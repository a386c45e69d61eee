//! # LiveSync Engine
//!
//! Live subscriptions and two-way sync replication over a relational database.
//!
//! This crate provides:
//! - Change feed listener with fixed-spacing reconnects
//! - Refcounted trigger coordination with coalesced creation
//! - Subscription registry with throttled result pushes
//! - Sync sessions: divergence detection, batch reconciliation and a
//!   write-coalescing buffer for client writes
//! - Collaborator traits for tables, clients, triggers and notifications
//! - An in-memory backend for tests and embedding
//!
//! ## Architecture
//!
//! ```text
//! NotificationSource ─▶ ChangeFeedListener ─▶ LiveSync::dispatch
//!                                                 │
//!                              (table, condition) │
//!                                                 ▼
//!                                      SubscriptionRegistry
//!                                       │               │
//!                               Subscription        SyncSession
//!                              (re-run query)   (reconciliation pass)
//! ```
//!
//! Database-side triggers notify with the positions of the matching
//! conditions in the table's condition list. The [`TriggerCoordinator`]
//! owns that list and keeps a trigger alive exactly while a subscription
//! or sync references it.
//!
//! ## Key Invariants
//!
//! - A row's synced value never decreases: updates only apply strictly
//!   newer versions
//! - At most one pass or flush runs per sync
//! - At most one push per subscription per throttle window, and the latest
//!   state is always delivered

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod hub;
mod listener;
mod memory;
mod replication;
mod state;
mod subscription;
mod table;
mod trigger;
mod wal;

pub use client::{ClientChannel, MemoryClient};
pub use config::{EngineConfig, ListenerConfig, DEFAULT_BATCH_SIZE, DEFAULT_CHANNEL_PREFIX};
pub use error::{SyncError, SyncResult};
pub use hub::{LiveSync, SchemaChange, SchemaHook};
pub use listener::{
    exit_process_hook, ChangeFeedListener, FatalHook, NotificationHandler, NotificationSource,
    NotificationStream,
};
pub use memory::{MemoryDatabase, MemoryNotificationSource, MemoryTable, MemoryTriggerStore};
pub use replication::{
    PassReport, PassSource, SessionParams, SyncSession, UpsertReport, INTERNAL_ERROR_NOTICE,
};
pub use state::{SyncAction, SyncEvent, SyncMachine, SyncPhase};
pub use subscription::{
    Destination, LocalCallback, SubscribeParams, Subscription, SubscriptionEvent,
    SubscriptionHandle, SubscriptionRegistry, SyncParams, SCHEMA_ERROR_NOTICE,
};
pub use table::{Database, FindParams, SyncRules, TableHandle, TableRules, TableTransaction};
pub use trigger::{TriggerCoordinator, TriggerKey, TriggerSpec, TriggerStore};
pub use wal::WriteBuffer;
