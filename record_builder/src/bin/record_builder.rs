use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use record_builder::{
    builder::SystemClock,
    config::{Settings, load_settings_path, resolve_settings_path},
    db::migrate,
    instruments::{
        catalog::load_catalog_path,
        sync::{SyncOptions, sync_instruments},
    },
    runner::{self, RunOptions, RunSummary},
    session::SqliteSessionStore,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Builds experiment records from instrument sessions")]
struct Cli {
    /// Settings TOML (defaults to $RECORD_BUILDER_CONFIG).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Apply pending database migrations.
    Migrate,
    /// Manage instrument reference data.
    Instruments(InstrumentsCmd),
    /// Pull usage events from the harvesters.
    Ingest,
    /// Build records for every pending session.
    Build {
        /// Ingest usage events first, under the same lock.
        #[arg(long)]
        ingest: bool,
    },
}

#[derive(Args)]
struct InstrumentsCmd {
    #[command(subcommand)]
    sub: InstrumentsSub,
}

#[derive(Subcommand)]
enum InstrumentsSub {
    /// Sync the instrument catalog into the database.
    Sync {
        #[arg(long, value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        prune: bool,
    },
}

fn init_logging() {
    let filter = if shared_utils::env::env_flag("RECORD_BUILDER_DEBUG") {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn settings(explicit: Option<&PathBuf>) -> Result<Settings> {
    let path = resolve_settings_path(explicit.map(PathBuf::as_path))?;
    load_settings_path(&path)
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let settings = settings(cli.config.as_ref()).context("load settings")?;

    match cli.cmd {
        Cmd::Migrate => {
            let applied = migrate::run_all(&settings.database_url)?;
            println!("applied {applied} migration(s)");
        }
        Cmd::Instruments(InstrumentsCmd {
            sub:
                InstrumentsSub::Sync {
                    file,
                    dry_run,
                    prune,
                },
        }) => {
            let cat = load_catalog_path(&file)?;
            let mut store = SqliteSessionStore::open(&settings.database_url)?;
            let diff = sync_instruments(store.connection(), cat, SyncOptions { dry_run, prune })?;
            print!("{diff}");
        }
        Cmd::Ingest => match runner::run_ingest(&settings)? {
            Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            None => println!("batch lock held; nothing done"),
        },
        Cmd::Build { ingest } => {
            let summary = runner::run_batch(
                &settings,
                SystemClock,
                RunOptions {
                    ingest_first: ingest,
                },
            )?;
            if let RunSummary::Locked = summary {
                println!("batch lock held; nothing done");
            } else {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
    }

    Ok(())
}
