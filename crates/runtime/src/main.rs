use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dh_domain::config::{Config, ConfigSeverity};
use dh_runtime::AppContext;

#[derive(Parser)]
#[command(name = "deskhand", about = "Deskhand assistant backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the backend (default).
    Serve,
    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            serve().await
        }
        Some(Command::Version) => {
            println!("deskhand {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the serve path.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

async fn serve() -> anyhow::Result<()> {
    tracing::info!("deskhand starting");

    let config = Config::from_env();
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    let error_count = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if error_count > 0 {
        anyhow::bail!("config validation failed with {error_count} error(s)");
    }

    let context = AppContext::start(config).await?;

    tracing::info!("deskhand ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received");

    context.shutdown().await;
    Ok(())
}
