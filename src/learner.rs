use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Learner {
    pub id: i64,
    pub name: String,
    pub email: String,
    /// IANA zone name, used for slot instants and streak day boundaries.
    pub timezone: String,
    pub reminder_minutes_before: i64,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub last_streak_update: Option<NaiveDate>,
}

impl Learner {
    pub fn streak(&self) -> Streak {
        Streak {
            current_streak: self.current_streak,
            longest_streak: self.longest_streak,
            last_streak_update: self.last_streak_update,
        }
    }
}

/// Consecutive-day completion counter, compared at calendar-day
/// granularity in the learner's zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Streak {
    pub current_streak: i64,
    pub longest_streak: i64,
    pub last_streak_update: Option<NaiveDate>,
}

impl Streak {
    /// `today` must already be the calendar date in the learner's zone.
    /// Same-day repeats are no-ops, a one-day gap extends the run, anything
    /// else starts over at 1.
    pub fn record_completion(&mut self, today: NaiveDate) {
        match self.last_streak_update {
            Some(last) if last == today => return,
            Some(last) if today.signed_duration_since(last).num_days() == 1 => {
                self.current_streak += 1;
            }
            _ => {
                self.current_streak = 1;
            }
        }
        self.longest_streak = self.longest_streak.max(self.current_streak);
        self.last_streak_update = Some(today);
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn learner_profile(&self, user_id: i64) -> Result<Learner>;
    async fn update_streak(&self, user_id: i64, streak: Streak) -> Result<()>;
}

/// Learner directory backed by the shared database.
#[derive(Debug, Clone)]
pub struct LearnerDirectory {
    database: SqlitePool,
}

impl LearnerDirectory {
    pub fn new(database: SqlitePool) -> Self {
        Self { database }
    }

    pub async fn create_learner(
        &self,
        name: &str,
        email: &str,
        timezone: &str,
    ) -> Result<i64> {
        let result = sqlx::query("INSERT INTO learner (name, email, timezone) VALUES (?, ?, ?)")
            .bind(name)
            .bind(email)
            .bind(timezone)
            .execute(&self.database)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn set_reminder_minutes_before(&self, user_id: i64, minutes: i64) -> Result<()> {
        sqlx::query("UPDATE learner SET reminder_minutes_before = ? WHERE id = ?")
            .bind(minutes)
            .bind(user_id)
            .execute(&self.database)
            .await?;
        Ok(())
    }

    pub async fn learner_list(&self) -> Result<Vec<Learner>> {
        let learners = sqlx::query_as::<_, Learner>(
            "SELECT id, name, email, timezone, reminder_minutes_before, \
             current_streak, longest_streak, last_streak_update \
             FROM learner ORDER BY id",
        )
        .fetch_all(&self.database)
        .await?;
        Ok(learners)
    }
}

#[async_trait]
impl UserDirectory for LearnerDirectory {
    async fn learner_profile(&self, user_id: i64) -> Result<Learner> {
        sqlx::query_as::<_, Learner>(
            "SELECT id, name, email, timezone, reminder_minutes_before, \
             current_streak, longest_streak, last_streak_update \
             FROM learner WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.database)
        .await?
        .ok_or_else(|| Error::not_found("learner", user_id))
    }

    async fn update_streak(&self, user_id: i64, streak: Streak) -> Result<()> {
        let result = sqlx::query(
            "UPDATE learner SET current_streak = ?, longest_streak = ?, last_streak_update = ? \
             WHERE id = ?",
        )
        .bind(streak.current_streak)
        .bind(streak.longest_streak)
        .bind(streak.last_streak_update)
        .bind(user_id)
        .execute(&self.database)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("learner", user_id));
        }
        Ok(())
    }
}
