//! tally-jobs - batch reconciliation CLI
//!
//! Runs the offline jobs against the same database the ingest service
//! writes. Every subcommand is a dry run unless `--commit` is given.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tally_common::config::Config;
use tally_jobs::jobs::{merge_contacts, recompute_locks, replay};

#[derive(Parser, Debug)]
#[command(name = "tally-jobs", about = "Batch reconciliation jobs")]
struct Args {
    /// SQLite database path (overrides TALLY_DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge contacts that share an email or provider id
    MergeDuplicates {
        /// Actually write; without this the plan is only printed
        #[arg(long)]
        commit: bool,
    },
    /// Recompute every contact's import-lock tier from durable signals
    RecomputeLocks {
        #[arg(long)]
        commit: bool,
    },
    /// Re-drive pending dead-lettered webhook payloads
    Replay {
        #[arg(long)]
        commit: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(path) = args.db_path {
        config.database_path = path.display().to_string();
    }

    let pool =
        tally_common::db::init_database_pool(std::path::Path::new(&config.database_path)).await?;
    info!("Database: {}", config.database_path);

    match args.command {
        Command::MergeDuplicates { commit } => {
            mode_banner(commit);
            let summary = merge_contacts::run(&pool, commit).await?;
            println!(
                "merge-duplicates: {} group(s), {} contact(s) {}, {} skipped (FULL_LOCK)",
                summary.groups,
                summary.merged,
                if commit { "merged" } else { "would merge" },
                summary.skipped_locked,
            );
        }
        Command::RecomputeLocks { commit } => {
            mode_banner(commit);
            let summary = recompute_locks::run(&pool, commit).await?;
            println!(
                "recompute-locks: {} examined, {} {}",
                summary.examined,
                summary.changed,
                if commit { "reclassified" } else { "would reclassify" },
            );
        }
        Command::Replay { commit } => {
            mode_banner(commit);
            let summary = replay::run(&pool, &config, commit).await?;
            println!(
                "replay: {} pending, {} succeeded, {} retired, {} still pending",
                summary.pending,
                summary.succeeded,
                summary.failed_terminal,
                summary.failed_retryable,
            );
        }
    }

    Ok(())
}

fn mode_banner(commit: bool) {
    if commit {
        info!("commit mode: changes will be written");
    } else {
        info!("dry run: pass --commit to write");
    }
}
