use anyhow::Context;
use clap::{Parser, Subcommand};
use ludod::daemon::{DaemonConfig, DaemonRuntime};
use ludod::sync::progress::SyncType;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "ludod=info,ludo_core=info";

#[derive(Debug, Parser)]
#[command(name = "ludod", version, about = "Keeps local game libraries in sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
enum Command {
    /// Run the daemon until interrupted (default)
    Run,
    /// Check that LUDO_API_KEY is accepted by the catalog
    CheckKey,
    /// Sync one owner in the foreground and print the result as JSON
    Sync {
        /// Remote account id of the owner
        owner: String,
        /// Reconcile the whole library instead of recent activity
        #[arg(long)]
        full: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    let config = DaemonConfig::from_env()?;
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            daemon.run().await
        }
        Command::CheckKey => {
            let client = config.catalog_client()?;
            if client
                .validate_api_key()
                .await
                .context("failed to reach the catalog")?
            {
                println!("API key is valid");
                Ok(())
            } else {
                anyhow::bail!("API key was rejected")
            }
        }
        Command::Sync { owner, full } => {
            let sync_type = if full {
                SyncType::Full
            } else {
                SyncType::Incremental
            };
            let daemon = DaemonRuntime::bootstrap(config).await?;
            let progress = daemon.sync_once(&owner, sync_type).await?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
            Ok(())
        }
    }
}
