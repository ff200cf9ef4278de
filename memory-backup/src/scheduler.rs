//! Cron-driven scheduled backups and signal-driven shutdown.

use crate::coordinator::{BackupCoordinator, BackupRequest};
use crate::models::BackupKind;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    coordinator: BackupCoordinator,
    /// Held for the duration of a scheduled backup.
    run_lock: Arc<Mutex<()>>,
}

impl BackupScheduler {
    pub async fn new(coordinator: BackupCoordinator) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            coordinator,
            run_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Register a full backup on `cron_expression` (six fields, seconds first).
    pub async fn schedule(&self, cron_expression: &str) -> anyhow::Result<()> {
        let coordinator = self.coordinator.clone();
        let run_lock = self.run_lock.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let coordinator = coordinator.clone();
            let run_lock = run_lock.clone();
            Box::pin(async move {
                run_scheduled_backup(&coordinator, &run_lock).await;
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        info!(cron = %cron_expression, "Backup scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    /// Stop firing new runs, then wait for an in-flight backup to publish its manifest.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        if self.run_lock.try_lock().is_err() {
            info!("Waiting for the running backup to finish");
        }
        let _idle = self.run_lock.lock().await;
        info!("Scheduler stopped");
        Ok(())
    }
}

/// One scheduled run. Overlapping triggers are skipped, not queued.
pub async fn run_scheduled_backup(coordinator: &BackupCoordinator, run_lock: &Mutex<()>) -> Option<String> {
    let Ok(_running) = run_lock.try_lock() else {
        warn!("Skipping scheduled backup: previous run still in progress");
        return None;
    };

    info!("Starting scheduled backup");
    match coordinator
        .create_backup(BackupRequest::all_engines(BackupKind::Scheduled))
        .await
    {
        Ok(id) => {
            info!(backup_id = %id, "Scheduled backup finished");
            Some(id)
        }
        Err(e) => {
            error!(error = %e, "Scheduled backup failed");
            None
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating graceful shutdown...");
        Ok(())
    }
}
