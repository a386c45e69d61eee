//! LiveSync CLI
//!
//! Operator tools for the PostgreSQL side of a LiveSync deployment.
//!
//! # Commands
//!
//! - `install` - Print or apply the bookkeeping schema
//! - `uninstall` - Remove the bookkeeping schema and its table triggers
//! - `listen` - Tail change notifications of an app channel
//! - `triggers` - List the triggers every app listens to
//! - `clean` - Forget apps that stopped heartbeating

mod commands;

use clap::{Parser, Subcommand};
use livesync_postgres::{PgConfig, DEFAULT_SCHEMA};
use tracing_subscriber::EnvFilter;

/// LiveSync command-line tools.
#[derive(Parser)]
#[command(name = "livesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// PostgreSQL connection URL
    #[arg(
        global = true,
        short,
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost/postgres"
    )]
    database_url: String,

    /// Bookkeeping schema
    #[arg(global = true, short, long, env = "LIVESYNC_SCHEMA", default_value = DEFAULT_SCHEMA)]
    schema: String,

    /// Prefix of app notification channels
    #[arg(global = true, long, env = "LIVESYNC_NOTIFY_PREFIX", default_value = "livesync_")]
    notify_prefix: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn pg_config(&self) -> PgConfig {
        PgConfig::new(&self.database_url)
            .with_schema(&self.schema)
            .with_notify_prefix(&self.notify_prefix)
            .with_max_connections(2)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print or apply the bookkeeping schema
    Install {
        /// Print the SQL instead of running it
        #[arg(short, long)]
        print: bool,
    },

    /// Remove the bookkeeping schema and every table trigger it created
    Uninstall {
        /// Print the SQL instead of running it
        #[arg(short, long)]
        print: bool,

        /// Confirm removal
        #[arg(long)]
        yes: bool,
    },

    /// Tail change notifications of an app channel
    Listen {
        /// App id whose channel to listen on
        app_id: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List the triggers apps listen to
    Triggers {
        /// Only show triggers of this app
        #[arg(short, long)]
        app_id: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Forget apps that stopped heartbeating and their triggers
    Clean,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.pg_config();
    match cli.command {
        Commands::Install { print } => {
            commands::install::install(&config, print).await?;
        }
        Commands::Uninstall { print, yes } => {
            if !print && !yes {
                return Err("uninstall drops the schema and its triggers, pass --yes".into());
            }
            commands::install::uninstall(&config, print).await?;
        }
        Commands::Listen { app_id, format } => {
            commands::listen::run(&config, &app_id, &format).await?;
        }
        Commands::Triggers { app_id, format } => {
            commands::triggers::list(&config, app_id.as_deref(), &format).await?;
        }
        Commands::Clean => {
            commands::triggers::clean(&config).await?;
        }
        Commands::Version => {
            println!("LiveSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
