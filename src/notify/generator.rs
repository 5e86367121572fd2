use std::sync::Arc;

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, warn};

use super::store::NotificationStore;
use super::types::NotificationKind;
use crate::catalog::{Catalog, CourseSchedule};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::learner::UserDirectory;

/// Stages future notification records for every active enrollment. Safe to
/// re-run for the same day: the notification key is unique at the storage
/// layer, so a repeat run (or a racing one) stages nothing new.
pub struct ScheduleGenerator {
    catalog: Arc<Catalog>,
    directory: Arc<dyn UserDirectory>,
    store: NotificationStore,
    clock: Arc<dyn Clock>,
    lookahead_days: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepStats {
    pub enrollments: usize,
    pub staged: usize,
    pub failed_enrollments: usize,
}

/// Resolve a local wall-clock slot to an instant. A DST gap has no valid
/// instant for that wall time; an overlap picks the earlier one.
fn slot_instant(date: NaiveDate, slot: NaiveTime, zone: Tz) -> Option<DateTime<Utc>> {
    match zone.from_local_datetime(&date.and_time(slot)) {
        LocalResult::Single(instant) => Some(instant.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

impl ScheduleGenerator {
    pub fn new(
        catalog: Arc<Catalog>,
        directory: Arc<dyn UserDirectory>,
        store: NotificationStore,
        clock: Arc<dyn Clock>,
        lookahead_days: i64,
    ) -> Self {
        Self {
            catalog,
            directory,
            store,
            clock,
            lookahead_days,
        }
    }

    /// Daily sweep over every enrollment with notifications on. One broken
    /// enrollment must not starve the rest, so per-enrollment errors are
    /// recorded and the loop moves on.
    pub async fn run_sweep(&self) -> Result<SweepStats> {
        let schedules = self.catalog.active_schedules().await?;
        let mut stats = SweepStats {
            enrollments: schedules.len(),
            ..Default::default()
        };
        for schedule in &schedules {
            match self.generate_for_schedule(schedule).await {
                Ok(staged) => stats.staged += staged,
                Err(e) => {
                    error!(
                        "schedule generation for {}/{} failed: {}",
                        schedule.user_id, schedule.course_id, e
                    );
                    stats.failed_enrollments += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Stage the notification pair for each lookahead day of one enrollment.
    /// Also called synchronously when an enrollment is created, so the first
    /// day's slots exist before the nightly sweep. Returns how many records
    /// were actually inserted.
    pub async fn generate_for_schedule(&self, schedule: &CourseSchedule) -> Result<usize> {
        if !schedule.notifications_enabled {
            return Ok(0);
        }
        let Some(slot) = schedule.slot()? else {
            return Ok(0);
        };
        let learner = self.directory.learner_profile(schedule.user_id).await?;
        let zone = schedule.zone(&learner.timezone)?;
        let now = self.clock.now_utc();
        let today = now.with_timezone(&zone).date_naive();

        let mut staged = 0;
        for day in 0..self.lookahead_days.max(1) {
            let date = today + Duration::days(day);
            if date < schedule.start_date {
                continue;
            }
            let Some(lesson_start) = slot_instant(date, slot, zone) else {
                warn!(
                    "slot {} on {} does not exist in {}, skipping day",
                    slot, date, zone
                );
                continue;
            };
            if lesson_start <= now {
                // today's slot already passed; tomorrow is another chance
                continue;
            }
            let reminder = lesson_start - Duration::minutes(learner.reminder_minutes_before);
            for (kind, instant) in [
                (NotificationKind::Reminder, reminder),
                (NotificationKind::LessonStart, lesson_start),
            ] {
                match self
                    .store
                    .insert_pending(schedule.user_id, schedule.course_id, instant, kind)
                    .await
                {
                    Ok(_) => staged += 1,
                    Err(Error::StoreContention(_)) => {
                        debug!(
                            "{} for {}/{} at {} already staged",
                            kind, schedule.user_id, schedule.course_id, instant
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(staged)
    }
}
