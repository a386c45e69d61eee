//! Install and uninstall commands.

use livesync_postgres::{PgBackend, PgConfig, SqlCatalog};

/// Prints or applies the install SQL.
pub async fn install(config: &PgConfig, print: bool) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = SqlCatalog::new(&config.schema, &config.notify_prefix)?;
    if print {
        println!("{}", catalog.install());
        return Ok(());
    }

    let pool = PgBackend::pool(config).await?;
    livesync_postgres::install(&pool, &catalog).await?;
    println!("Installed schema {}", catalog.schema());
    Ok(())
}

/// Prints or applies the uninstall SQL.
pub async fn uninstall(config: &PgConfig, print: bool) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = SqlCatalog::new(&config.schema, &config.notify_prefix)?;
    if print {
        println!("{}", catalog.uninstall());
        return Ok(());
    }

    let pool = PgBackend::pool(config).await?;
    livesync_postgres::uninstall(&pool, &catalog).await?;
    println!("Removed schema {}", catalog.schema());
    Ok(())
}
