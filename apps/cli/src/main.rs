//! Ferry CLI - resumable downloads from the command line
//!
//! Jobs are kept in a SQLite database under the data directory, so a
//! download interrupted with Ctrl-C (or a crash) can be resumed later.

mod commands;
mod output;
mod progress;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ferry_types::{EngineConfig, JobState};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Ferry - resumable downloads
#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for the job database and config.json
    #[arg(long, env = "FERRY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL, following progress until it stops (Ctrl-C pauses)
    Get {
        /// URL to download
        url: String,

        /// Directory to save into (defaults to the current directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// File name (defaults to the last segment of the URL)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Resume a paused or failed download from where it stopped
    Resume {
        /// Job ID (or a unique prefix)
        id: String,
    },

    /// Start a download over from the beginning
    Retry {
        /// Job ID (or a unique prefix)
        id: String,
    },

    /// Cancel a download and delete its partial file
    Cancel {
        /// Job ID (or a unique prefix)
        id: String,
    },

    /// Forget a download (unfinished downloads are cancelled first)
    Remove {
        /// Job ID (or a unique prefix)
        id: String,
    },

    /// List downloads
    List {
        /// Only show jobs in this state
        #[arg(short, long)]
        state: Option<JobState>,
    },

    /// Show download info
    Info {
        /// Job ID (or a unique prefix)
        id: String,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "ferry=debug,ferry_core=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn load_config(data_dir: &Path) -> Result<EngineConfig> {
    let path = data_dir.join("config.json");
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => serde_json::from_str(&text).with_context(|| format!("invalid config file {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EngineConfig::default()),
        Err(e) => Err(e).with_context(|| format!("cannot read {}", path.display())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("ferry"))
            .unwrap_or_else(|| PathBuf::from(".ferry"))
    });
    let config = load_config(&data_dir).await?;
    tracing::debug!("Using data directory {}", data_dir.display());

    match cli.command {
        Commands::Get { url, dir, name } => commands::get(&data_dir, config, &url, dir, name, cli.output).await?,

        Commands::Resume { id } => commands::resume(&data_dir, config, &id, cli.output).await?,

        Commands::Retry { id } => commands::retry(&data_dir, config, &id, cli.output).await?,

        Commands::Cancel { id } => commands::cancel(&data_dir, config, &id, cli.output).await?,

        Commands::Remove { id } => commands::remove(&data_dir, config, &id, cli.output).await?,

        Commands::List { state } => commands::list(&data_dir, state, cli.output).await?,

        Commands::Info { id } => commands::info(&data_dir, &id, cli.output).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "ferry", &mut std::io::stdout());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_config_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path()).await.unwrap();
        assert_eq!(config.chunk_size, EngineConfig::default().chunk_size);
    }

    #[tokio::test]
    async fn partial_config_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("config.json"), r#"{"chunk_size": 4096}"#)
            .await
            .unwrap();

        let config = load_config(dir.path()).await.unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.progress_interval_ms, 750);
    }

    #[test]
    fn parses_state_filter() {
        let cli = Cli::try_parse_from(["ferry", "list", "--state", "paused"]).unwrap();
        assert!(matches!(cli.command, Commands::List { state: Some(JobState::Paused) }));
    }
}
