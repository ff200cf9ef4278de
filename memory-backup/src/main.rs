//! Memory Backup - Main entry point
//!
//! Each subcommand is a thin wrapper over one coordinator operation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand};
use memory_backup::coordinator::{BackupCoordinator, BackupRequest};
use memory_backup::engines::{AdapterRegistry, Engine};
use memory_backup::manifest::{self, BackupFilter};
use memory_backup::models::{BackupKind, BackupStatus, RestoreResult};
use memory_backup::scheduler::{self, BackupScheduler};
use memory_backup::tool::ProcessRunner;
use memory_backup::{utils, Config, CoordinatorError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up the selected engines and print the new backup id
    BackupCreate {
        /// manual or scheduled
        #[arg(long = "type", default_value = "manual")]
        kind: BackupKind,

        /// Comma-separated engine names (default: all engines)
        #[arg(long, value_delimiter = ',')]
        engines: Vec<String>,

        /// Compress artifacts
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        compress: bool,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// List backups, newest first
    BackupList {
        #[arg(long = "type")]
        kind: Option<BackupKind>,

        #[arg(long)]
        status: Option<BackupStatus>,

        /// Only backups created before this RFC 3339 timestamp
        #[arg(long)]
        before: Option<DateTime<Utc>>,

        #[arg(long)]
        limit: Option<usize>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print a backup manifest
    BackupShow { backup_id: String },

    /// Remove a backup directory
    BackupDelete { backup_id: String },

    /// Restore every successfully backed-up engine
    RestoreAll { backup_id: String },

    /// Restore a single engine
    RestoreEngine { backup_id: String, engine: Engine },

    /// Check every engine's health
    Health,

    /// Run scheduled backups of all engines until interrupted
    Schedule {
        /// Cron expression with seconds, e.g. "0 0 3 * * *"
        #[arg(long)]
        cron: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting memory-backup v{} (backup root: {})",
        env!("CARGO_PKG_VERSION"),
        config.backup.root.display()
    );

    let runner = Arc::new(ProcessRunner::new(config.kill_grace()));
    let registry = AdapterRegistry::from_config(&config, runner);
    let coordinator = BackupCoordinator::from_config(&config, registry)?;

    match args.command {
        Command::BackupCreate {
            kind,
            engines,
            compress,
            description,
        } => {
            let engines = if engines.is_empty() {
                Engine::ALL.iter().map(|e| e.to_string()).collect()
            } else {
                engines
            };
            let id = coordinator
                .create_backup(BackupRequest {
                    kind,
                    engines,
                    compress,
                    description,
                })
                .await?;
            let status = coordinator.show_backup(&id).await?.status();
            println!("{}", id);
            // The manifest status carries the outcome; only setup errors exit non-zero.
            if status == BackupStatus::Completed {
                tracing::info!(backup_id = %id, status = %status, "Backup created");
            } else {
                tracing::warn!(backup_id = %id, status = %status, "Backup created with failed engines");
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::BackupList {
            kind,
            status,
            before,
            limit,
            json,
        } => {
            let filter = BackupFilter {
                kind,
                status,
                before,
                limit,
            };
            let listing = coordinator.list_backups(&filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                for summary in &listing.backups {
                    let engines: Vec<String> = summary
                        .engines
                        .iter()
                        .map(|(engine, status)| format!("{}={}", engine, status))
                        .collect();
                    println!(
                        "{}  {}  {:<9}  {:<15}  {:>12}  {}",
                        summary.id,
                        summary.created_at.to_rfc3339(),
                        summary.kind,
                        summary.status,
                        summary.total_size_bytes,
                        engines.join(",")
                    );
                }
                for warning in &listing.warnings {
                    eprintln!("warning: {}: {}", warning.id, warning.reason);
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::BackupShow { backup_id } => {
            let set = coordinator.show_backup(&backup_id).await?;
            println!("{}", String::from_utf8_lossy(&manifest::encode(&set)?));
            Ok(ExitCode::SUCCESS)
        }

        Command::BackupDelete { backup_id } => {
            coordinator.delete_backup(&backup_id).await?;
            println!("Deleted {}", backup_id);
            Ok(ExitCode::SUCCESS)
        }

        Command::RestoreAll { backup_id } => {
            let result = coordinator
                .recovery()
                .restore_from_backup(&backup_id, None)
                .await;
            report_restore(result)
        }

        Command::RestoreEngine { backup_id, engine } => {
            let result = coordinator
                .recovery()
                .restore_engine(&backup_id, engine)
                .await;
            report_restore(result)
        }

        Command::Health => {
            let health = coordinator.health_check().await;
            for (engine, healthy) in &health {
                println!("{:<13} {}", engine, if *healthy { "healthy" } else { "unhealthy" });
            }
            Ok(exit_code(health.values().all(|healthy| *healthy)))
        }

        Command::Schedule { cron } => {
            let scheduler = BackupScheduler::new(coordinator).await?;
            scheduler.schedule(&cron).await?;
            scheduler.start().await?;
            tracing::info!(cron = %cron, "Scheduler running");

            scheduler::wait_for_shutdown_signal().await?;
            scheduler.shutdown().await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn report_restore(result: memory_backup::Result<RestoreResult>) -> Result<ExitCode> {
    match result {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(exit_code(!result.is_failed()))
        }
        Err(e @ CoordinatorError::NotFound(_)) => {
            eprintln!("Error: {}", e);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
