use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::types::{NotificationKind, NotificationStatus, ScheduledNotification};
use crate::error::{Error, Result, is_unique_violation};

/// Durable notification queue. The UNIQUE index over
/// (user_id, course_id, scheduled_time, kind) is what makes generation
/// idempotent; application code only reacts to its verdict.
#[derive(Debug, Clone)]
pub struct NotificationStore {
    database: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: i64,
    user_id: i64,
    course_id: i64,
    scheduled_time: DateTime<Utc>,
    kind: String,
    status: String,
    sent_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    retry_count: i64,
}

impl NotificationRow {
    fn into_notification(self) -> Result<ScheduledNotification> {
        Ok(ScheduledNotification {
            id: self.id,
            user_id: self.user_id,
            course_id: self.course_id,
            scheduled_time: self.scheduled_time,
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            sent_at: self.sent_at,
            error_message: self.error_message,
            retry_count: self.retry_count,
        })
    }
}

const NOTIFICATION_COLUMNS: &str = "id, user_id, course_id, scheduled_time, kind, status, \
     sent_at, error_message, retry_count";

impl NotificationStore {
    pub fn new(database: SqlitePool) -> Self {
        Self { database }
    }

    /// Insert a fresh `pending` record. A duplicate idempotency key means a
    /// concurrent (or earlier) generator run already staged this send; that
    /// surfaces as [`Error::StoreContention`] and callers treat it as a skip.
    pub async fn insert_pending(
        &self,
        user_id: i64,
        course_id: i64,
        scheduled_time: DateTime<Utc>,
        kind: NotificationKind,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO scheduled_notification (user_id, course_id, scheduled_time, kind, status) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(course_id)
        .bind(scheduled_time)
        .bind(kind.as_str())
        .bind(NotificationStatus::Pending.as_str())
        .execute(&self.database)
        .await;
        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(Error::StoreContention("notification")),
            Err(e) => Err(e.into()),
        }
    }

    /// Due `pending` records, oldest scheduled first, capped so one dispatch
    /// tick stays bounded.
    pub async fn due_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledNotification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM scheduled_notification \
             WHERE status = ? AND scheduled_time <= ? \
             ORDER BY scheduled_time, id LIMIT ?"
        ))
        .bind(NotificationStatus::Pending.as_str())
        .bind(now)
        .bind(limit)
        .fetch_all(&self.database)
        .await?;
        rows.into_iter().map(NotificationRow::into_notification).collect()
    }

    pub async fn mark_sent(&self, id: i64, sent_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE scheduled_notification SET status = ?, sent_at = ? WHERE id = ?")
            .bind(NotificationStatus::Sent.as_str())
            .bind(sent_at)
            .bind(id)
            .execute(&self.database)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64, error_message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE scheduled_notification SET status = ?, error_message = ?, \
             retry_count = retry_count + 1 WHERE id = ?",
        )
        .bind(NotificationStatus::Failed.as_str())
        .bind(error_message)
        .bind(id)
        .execute(&self.database)
        .await?;
        Ok(())
    }

    /// Delete `sent` records strictly older than the cutoff. A record sent
    /// exactly at the cutoff survives. Pending and failed records are never
    /// touched here.
    pub async fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let done = sqlx::query(
            "DELETE FROM scheduled_notification WHERE status = ? AND sent_at < ?",
        )
        .bind(NotificationStatus::Sent.as_str())
        .bind(cutoff)
        .execute(&self.database)
        .await?;
        Ok(done.rows_affected())
    }

    /// Everything queued for one enrollment, in send order.
    pub async fn for_enrollment(
        &self,
        user_id: i64,
        course_id: i64,
    ) -> Result<Vec<ScheduledNotification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM scheduled_notification \
             WHERE user_id = ? AND course_id = ? ORDER BY scheduled_time, kind"
        ))
        .bind(user_id)
        .bind(course_id)
        .fetch_all(&self.database)
        .await?;
        rows.into_iter().map(NotificationRow::into_notification).collect()
    }

    pub async fn count_with_status(&self, status: NotificationStatus) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_notification WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(&self.database)
                .await?;
        Ok(count)
    }
}
