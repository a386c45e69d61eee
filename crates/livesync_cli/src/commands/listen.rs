//! Listen command implementation.

use livesync_engine::{ChangeFeedListener, ListenerConfig};
use livesync_postgres::{PgBackend, PgConfig, PgNotificationSource, SqlCatalog};
use livesync_protocol::Notification;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// One decoded notification.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NotificationRecord {
    /// Rows changed.
    Data {
        /// Table name.
        table: String,
        /// Operation.
        op: String,
        /// Positions of the matching conditions.
        condition_ids: Vec<usize>,
    },
    /// A condition failed to evaluate.
    ConditionError {
        /// Table name.
        table: String,
        /// Operation.
        op: String,
        /// Database error text.
        message: String,
    },
    /// A DDL command ran.
    Schema {
        /// Command tag.
        command: String,
        /// Query text.
        query: String,
    },
    /// The payload could not be parsed.
    Invalid {
        /// Raw payload.
        payload: String,
    },
}

impl NotificationRecord {
    /// Decodes a raw payload.
    pub fn parse(payload: &str) -> Self {
        match Notification::parse(payload) {
            Ok(Notification::Data {
                table,
                op,
                condition_ids,
            }) => NotificationRecord::Data {
                table,
                op: op.as_str().to_string(),
                condition_ids,
            },
            Ok(Notification::ConditionError { table, op, message }) => {
                NotificationRecord::ConditionError {
                    table,
                    op: op.as_str().to_string(),
                    message,
                }
            }
            Ok(Notification::Schema { command, query, .. }) => {
                NotificationRecord::Schema { command, query }
            }
            Err(_) => NotificationRecord::Invalid {
                payload: payload.to_string(),
            },
        }
    }

    /// One-line text rendering.
    pub fn to_text(&self) -> String {
        match self {
            NotificationRecord::Data {
                table,
                op,
                condition_ids,
            } => format!("{op:<6} {table} conditions={condition_ids:?}"),
            NotificationRecord::ConditionError { table, op, message } => {
                format!("{op:<6} {table} error: {message}")
            }
            NotificationRecord::Schema { command, query } => format!("SCHEMA {command}: {query}"),
            NotificationRecord::Invalid { payload } => format!("?      {payload}"),
        }
    }
}

/// Prints notifications sent to `app_id` until interrupted.
pub async fn run(
    config: &PgConfig,
    app_id: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = SqlCatalog::new(&config.schema, &config.notify_prefix)?;
    let channel = catalog.channel(app_id);
    let pool = PgBackend::pool(config).await?;
    let source = Arc::new(PgNotificationSource::new(pool));

    let json = format == "json";
    let listener = ChangeFeedListener::new(ListenerConfig::default());
    listener.start(
        source,
        channel.clone(),
        Arc::new(move |payload: String| {
            let record = NotificationRecord::parse(&payload);
            if json {
                match serde_json::to_string(&record) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "could not encode notification"),
                }
            } else {
                println!("{}", record.to_text());
            }
        }),
    )?;

    eprintln!("Listening on {channel}, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    listener.stop().await;
    Ok(())
}
