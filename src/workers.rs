use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::notify::{DispatchWorker, RetentionSweeper, ScheduleGenerator};

pub const DAILY_SWEEP_SECS: u64 = 86_400;

/// Daily generation sweep. `interval` fires its first tick at once, so a
/// fresh process stages today's slots without waiting a day.
pub fn spawn_generation(generator: ScheduleGenerator) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(DAILY_SWEEP_SECS));
        loop {
            ticker.tick().await;
            match generator.run_sweep().await {
                Ok(stats) => info!(
                    "generation sweep: {} enrollments, {} staged, {} failed",
                    stats.enrollments, stats.staged, stats.failed_enrollments
                ),
                Err(e) => error!("generation sweep failed: {}", e),
            }
        }
    })
}

/// Minute-level drain of due notifications.
pub fn spawn_dispatch(worker: DispatchWorker, tick_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        // interval panics on a zero period
        let mut ticker = tokio::time::interval(Duration::from_secs(tick_secs.max(1)));
        loop {
            ticker.tick().await;
            match worker.tick().await {
                Ok(stats) if stats.selected > 0 => info!(
                    "dispatch tick: {} due, {} sent, {} failed",
                    stats.selected, stats.sent, stats.failed
                ),
                Ok(_) => {}
                Err(e) => error!("dispatch tick failed: {}", e),
            }
        }
    })
}

/// Daily purge of aged-out sent notifications.
pub fn spawn_retention(sweeper: RetentionSweeper) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(DAILY_SWEEP_SECS));
        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.sweep().await {
                error!("retention sweep failed: {}", e);
            }
        }
    })
}
