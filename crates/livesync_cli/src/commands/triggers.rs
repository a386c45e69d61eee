//! Trigger listing and cleanup.

use livesync_postgres::{list_triggers, prune, AppTrigger, PgBackend, PgConfig, SqlCatalog};
use serde::Serialize;

/// A trigger row for output.
#[derive(Debug, Serialize)]
pub struct TriggerRow {
    /// Owning app.
    pub app_id: String,
    /// Watched table.
    pub table: String,
    /// SQL condition.
    pub condition: String,
    /// Seconds since the app last confirmed the trigger.
    pub idle_secs: f64,
}

impl From<AppTrigger> for TriggerRow {
    fn from(t: AppTrigger) -> Self {
        Self {
            app_id: t.app_id,
            table: t.table_name,
            condition: t.condition,
            idle_secs: t.idle_secs,
        }
    }
}

/// Lists triggers, optionally of one app.
pub async fn list(
    config: &PgConfig,
    app_id: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = SqlCatalog::new(&config.schema, &config.notify_prefix)?;
    let pool = PgBackend::pool(config).await?;
    let rows: Vec<TriggerRow> = list_triggers(&pool, &catalog, app_id)
        .await?
        .into_iter()
        .map(TriggerRow::from)
        .collect();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        _ => print_text_output(&rows),
    }
    Ok(())
}

/// Deletes apps that stopped heartbeating and their triggers.
pub async fn clean(config: &PgConfig) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = SqlCatalog::new(&config.schema, &config.notify_prefix)?;
    let pool = PgBackend::pool(config).await?;
    let before = list_triggers(&pool, &catalog, None).await?.len();
    prune(&pool, &catalog).await?;
    let after = list_triggers(&pool, &catalog, None).await?.len();
    println!("Removed {} trigger(s)", before.saturating_sub(after));
    Ok(())
}

fn print_text_output(rows: &[TriggerRow]) {
    if rows.is_empty() {
        println!("No triggers");
        return;
    }
    println!("LiveSync Triggers");
    println!("=================");
    let mut current_app = None;
    for row in rows {
        if current_app != Some(&row.app_id) {
            println!();
            println!("App {}:", row.app_id);
            current_app = Some(&row.app_id);
        }
        println!(
            "  {:<24} {:<40} idle {}",
            row.table,
            row.condition,
            format_idle(row.idle_secs)
        );
    }
}

fn format_idle(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_durations() {
        assert_eq!(format_idle(2.04), "2.0s");
        assert_eq!(format_idle(90.0), "1.5m");
        assert_eq!(format_idle(5400.0), "1.5h");
    }

    #[test]
    fn rows_serialize_flat() {
        let row = TriggerRow::from(AppTrigger {
            app_id: "a1".into(),
            table_name: "items".into(),
            condition: "TRUE".into(),
            idle_secs: 1.5,
        });
        assert_eq!(
            serde_json::to_value(&row).unwrap(),
            serde_json::json!({
                "app_id": "a1",
                "table": "items",
                "condition": "TRUE",
                "idle_secs": 1.5,
            })
        );
    }
}
