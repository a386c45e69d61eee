//! # LiveSync Server
//!
//! Connection-facing layer of LiveSync.
//!
//! This crate provides:
//! - Per-connection request handling (subscribe, unsubscribe, sync, unsync)
//! - Routing of client sync messages to their sync sessions
//! - Disconnect cleanup
//! - Table rule resolution per connection
//! - Server configuration (app id, notification channel, engine settings)
//!
//! # Architecture
//!
//! The server is transport agnostic. A socket layer wraps each connection in
//! a [`livesync_engine::ClientChannel`], registers it with
//! [`SyncServer::connect`] and forwards every incoming message to the
//! returned [`ConnectionHandler`]:
//!
//! ```rust,ignore
//! let server = SyncServer::build(db, triggers, rules, ServerConfig::default());
//! server.start(notifications)?;
//!
//! let handler = server.connect(client)?;
//! let channel = handler.subscribe(request).await?;
//! // later, on a message for `channel + "unsubscribe"`:
//! handler.handle_message(&unsubscribe_channel, payload).await?;
//! ```
//!
//! # Errors reaching clients
//!
//! Client mistakes (bad requests, missing grants, unknown channels) are
//! answered with their message. Everything else is logged and answered with
//! a generic notice.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod rules;
mod server;

pub use config::{ServerConfig, DEFAULT_NOTIFY_PREFIX};
pub use error::{ServerError, ServerResult};
pub use handler::{ConnectionHandler, HandlerContext};
pub use rules::{RuleResolver, StaticRules};
pub use server::SyncServer;
