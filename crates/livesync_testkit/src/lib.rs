//! # LiveSync Testkit
//!
//! Test utilities for LiveSync.
//!
//! This crate provides:
//! - A test hub wired to an in-memory database
//! - Row builders and polling helpers
//! - Property-based generators for diverged client and server replicas
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livesync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn client_catches_up() {
//!     let hub = TestHub::new().with_table("items", item_rows(1..=10)).started();
//!     let client = empty_client("c1");
//!     let channel = hub.sync(&client, "items").await;
//!     hub.client_pass(&client, &channel).await;
//!     assert_eq!(client.replica_rows().len(), 10);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
