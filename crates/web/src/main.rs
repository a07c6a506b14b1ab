//! Custom Installer Builder
//!
//! `cib serve` runs the HTTP service, `cib clean` clears packaged installers,
//! `cib init` writes a configuration file.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cib_common::{BuildManager, BuilderConfig, Database};

#[derive(Parser)]
#[command(name = "cib")]
#[command(about = "Custom Installer Builder - vessel partitioning and installer packaging")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "CIB_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long, global = true, env = "CIB_STORE")]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the web service
    Serve {
        /// HTTP listen address
        #[arg(short, long, env = "CIB_LISTEN")]
        listen: Option<SocketAddr>,

        /// Public URL prefix for download links
        #[arg(long, env = "CIB_BASE_URL")]
        base_url: Option<String>,
    },

    /// Remove packaged installers so they are rebuilt on request
    Clean {
        /// Delete whole builds, including keys and records
        #[arg(long)]
        purge: bool,

        /// Drop browser sessions idle for this many days
        #[arg(long, default_value = "30")]
        session_days: i64,
    },

    /// Write the effective configuration to the config path
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(cib_common::default_config_path);
    let mut config = BuilderConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    match cli.command {
        Commands::Serve { listen, base_url } => {
            if let Some(listen) = listen {
                config.listen = listen.to_string();
            }
            if let Some(base_url) = base_url {
                config.base_url = base_url;
            }
            let addr: SocketAddr = config.listen.parse()?;

            info!(
                "Custom Installer Builder v{} (store: {:?})",
                cib_common::VERSION,
                config.store_path
            );
            cib_web::server::serve(addr, &config).await
        }
        Commands::Clean {
            purge,
            session_days,
        } => {
            let db = Database::open(config.db_path(), config.limits())?;
            let builds = BuildManager::from_config(&config, db.clone())?;

            let report = builds.clean(purge)?;
            let cutoff = chrono::Utc::now() - chrono::Duration::days(session_days);
            let pruned = db.prune_sessions(cutoff.timestamp())?;

            println!(
                "scanned {} builds, removed {} installers, purged {} builds, pruned {} sessions",
                report.builds_scanned, report.installers_removed, report.builds_purged, pruned
            );
            Ok(())
        }
        Commands::Init { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists, pass --force to overwrite it",
                    config_path.display()
                );
            }
            config.save(&config_path)?;
            info!("Wrote configuration to {:?}", config_path);
            println!("{}", config_path.display());
            Ok(())
        }
    }
}
