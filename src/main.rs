use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use counterparty_ledger::{
    ingest, list_entries, load_optional_config, open_database, Actor, AppConfig, Artifact, FsArtifactStore,
};

#[derive(Parser)]
#[command(name = "counterparty-ledger", version, about = "Reconcile counterparty debt/credit reports into SQLite")]
struct Cli {
    /// JSON settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database (overrides config and LEDGER_DATABASE_PATH)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Directory where uploaded artifacts are retained
    #[arg(long, global = true)]
    artifact_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema
    Init,
    /// Ingest one report file
    Import {
        file: PathBuf,
        /// Authenticated user the upload is recorded under
        #[arg(long)]
        actor: String,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Show recent ingestion runs
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn load_settings(cli: &Cli) -> Result<AppConfig> {
    let mut config = load_optional_config(cli.config.as_deref())?.with_env_overrides();
    if let Some(path) = &cli.database {
        config.database_path = path.clone();
    }
    if let Some(dir) = &cli.artifact_dir {
        config.artifact_dir = dir.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "counterparty_ledger=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_settings(&cli)?;

    match cli.command {
        Command::Init => {
            open_database(&config.database_path, config.ingest.busy_timeout_ms)
                .with_context(|| format!("Initializing {}", config.database_path.display()))?;
            println!("✓ Database ready: {}", config.database_path.display());
        }
        Command::Import { file, actor, batch_size } => {
            if let Some(size) = batch_size {
                config.ingest.batch_size = size;
            }

            let content = fs::read(&file).with_context(|| format!("Reading {}", file.display()))?;
            let name = file.file_name().map(|n| n.to_string_lossy().into_owned());
            let artifact = Artifact::new(content, name);

            let mut conn = open_database(&config.database_path, config.ingest.busy_timeout_ms)
                .with_context(|| format!("Opening {}", config.database_path.display()))?;
            let store = FsArtifactStore::new(&config.artifact_dir);

            let result = ingest(&mut conn, &artifact, &Actor::new(actor), &store, &config.ingest)
                .with_context(|| format!("Ingesting {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::History { limit } => {
            let conn = open_database(&config.database_path, config.ingest.busy_timeout_ms)
                .with_context(|| format!("Opening {}", config.database_path.display()))?;
            let entries = list_entries(&conn, limit)?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }

    Ok(())
}
