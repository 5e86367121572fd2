use std::sync::Arc;

use chrono::Duration;
use tracing::info;

use super::store::NotificationStore;
use crate::clock::Clock;
use crate::error::Result;

/// Deletes sent notifications once they age out. Pending and failed records
/// are never touched: pending is future work and failed is the only evidence
/// a delivery went wrong.
pub struct RetentionSweeper {
    store: NotificationStore,
    clock: Arc<dyn Clock>,
    retention_days: i64,
}

impl RetentionSweeper {
    pub fn new(store: NotificationStore, clock: Arc<dyn Clock>, retention_days: i64) -> Self {
        Self {
            store,
            clock,
            retention_days,
        }
    }

    pub async fn sweep(&self) -> Result<u64> {
        let cutoff = self.clock.now_utc() - Duration::days(self.retention_days);
        let purged = self.store.purge_sent_before(cutoff).await?;
        if purged > 0 {
            info!("purged {} sent notifications older than {}", purged, cutoff);
        }
        Ok(purged)
    }
}
