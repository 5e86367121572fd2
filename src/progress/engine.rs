use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::warn;

use super::store::ProgressStore;
use super::types::{
    AdvanceOutcome, LearningProgress, LessonPatch, LessonProgress, LessonStatus, ModuleQuizResult,
    ProgressSummary, TeachingState,
};
use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::learner::UserDirectory;

enum AdvanceTarget {
    NextLesson(i64, String),
    NextModule(i64, String),
    EndOfCourse,
}

/// State-transition logic over the progress store and the course catalog.
///
/// Multi-field updates for one (user, course) key run under a per-key lock;
/// two learners (or two courses of one learner) never contend. Reads like
/// `progress_summary` take no lock, they see some consistent recent state.
pub struct ProgressionEngine {
    catalog: Arc<Catalog>,
    store: ProgressStore,
    directory: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    locks: DashMap<(i64, i64), Arc<Mutex<()>>>,
}

impl ProgressionEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        store: ProgressStore,
        directory: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            store,
            directory,
            clock,
            locks: DashMap::new(),
        }
    }

    fn key_lock(&self, user_id: i64, course_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry((user_id, course_id))
            .or_default()
            .clone()
    }

    /// Returns the stored progress, initializing one at the course's first
    /// lesson in `greeting` when none exists yet. Safe to race: creation is
    /// an upsert, so no lock is needed here.
    pub async fn get_or_create_progress(
        &self,
        user_id: i64,
        course_id: i64,
    ) -> Result<LearningProgress> {
        let (module_number, lesson_number) = {
            let course = self.catalog.get_course(course_id).await?;
            let (module_number, lesson) = course
                .first_lesson()
                .ok_or_else(|| Error::not_found("first lesson of course", course_id))?;
            (module_number, lesson.lesson_number.clone())
        };
        self.store
            .create_if_absent(
                user_id,
                course_id,
                module_number,
                &lesson_number,
                self.clock.now_utc(),
            )
            .await?;
        self.store.get_required(user_id, course_id).await
    }

    /// Persist an externally driven state change. Equal states are a no-op
    /// (the subtopic pointer still moves if given). `answering_question`
    /// remembers the state it interrupted; leaving it forgets. Declaring
    /// `completed` finishes the course, and nothing leaves `completed`.
    pub async fn update_teaching_state(
        &self,
        user_id: i64,
        course_id: i64,
        next: TeachingState,
        current_subtopic: Option<i64>,
    ) -> Result<LearningProgress> {
        let lock = self.key_lock(user_id, course_id);
        let _guard = lock.lock().await;
        let progress = self.store.get_required(user_id, course_id).await?;
        let current = progress.teaching_state;
        let now = self.clock.now_utc();
        if current == next {
            if let Some(index) = current_subtopic {
                self.store
                    .set_subtopic_index(user_id, course_id, index, now)
                    .await?;
                return self.store.get_required(user_id, course_id).await;
            }
            return Ok(progress);
        }
        if current.is_terminal() {
            return Err(Error::invalid_transition(current, next));
        }
        if next == TeachingState::Completed {
            self.store.mark_course_completed(user_id, course_id, now).await?;
            return self.store.get_required(user_id, course_id).await;
        }
        let return_state = match next {
            TeachingState::AnsweringQuestion => Some(current),
            _ => None,
        };
        self.store
            .set_teaching_state(user_id, course_id, next, return_state, current_subtopic, now)
            .await?;
        self.store.get_required(user_id, course_id).await
    }

    /// Create-or-merge one lesson's progress entry. A transition into
    /// `completed` is the one place streaks move.
    pub async fn upsert_lesson_progress(
        &self,
        user_id: i64,
        course_id: i64,
        module_number: i64,
        lesson_number: &str,
        patch: LessonPatch,
    ) -> Result<LessonProgress> {
        let lock = self.key_lock(user_id, course_id);
        let _guard = lock.lock().await;
        let subtopic_count = {
            let course = self.catalog.get_course(course_id).await?;
            course
                .subtopic_count(module_number, lesson_number)
                .ok_or_else(|| {
                    Error::not_found(
                        "lesson",
                        format!("{course_id}/{module_number}/{lesson_number}"),
                    )
                })?
        };
        self.store.ensure_exists(user_id, course_id).await?;
        let now = self.clock.now_utc();
        let mut entry = match self
            .store
            .get_lesson(user_id, course_id, module_number, lesson_number)
            .await?
        {
            Some(entry) => entry,
            None => LessonProgress::new(module_number, lesson_number.to_string(), subtopic_count, now),
        };
        let was_completed = entry.status == LessonStatus::Completed;
        entry.merge(patch, now);
        self.store.upsert_lesson(user_id, course_id, &entry).await?;
        if !was_completed && entry.status == LessonStatus::Completed {
            self.record_streak_day(user_id).await?;
        }
        Ok(entry)
    }

    /// Flag one subtopic as understood, note it in the teaching context and
    /// move the subtopic pointer past it. An out-of-range index is ignored;
    /// the caller's view of the lesson is simply ahead of the catalog's.
    pub async fn confirm_subtopic_understanding(
        &self,
        user_id: i64,
        course_id: i64,
        module_number: i64,
        lesson_number: &str,
        subtopic_index: usize,
    ) -> Result<LearningProgress> {
        let lock = self.key_lock(user_id, course_id);
        let _guard = lock.lock().await;
        let progress = self.store.get_required(user_id, course_id).await?;
        let (subtopic_count, subtopic_name) = {
            let course = self.catalog.get_course(course_id).await?;
            let lesson = course.lesson(module_number, lesson_number).ok_or_else(|| {
                Error::not_found(
                    "lesson",
                    format!("{course_id}/{module_number}/{lesson_number}"),
                )
            })?;
            (
                lesson.subtopics.len(),
                lesson.subtopics.get(subtopic_index).cloned(),
            )
        };
        let Some(subtopic_name) = subtopic_name else {
            warn!(
                "subtopic index {} out of range for lesson {}/{} of course {}, ignoring",
                subtopic_index, module_number, lesson_number, course_id
            );
            return Ok(progress);
        };
        let now = self.clock.now_utc();
        let mut entry = match self
            .store
            .get_lesson(user_id, course_id, module_number, lesson_number)
            .await?
        {
            Some(entry) => entry,
            None => LessonProgress::new(module_number, lesson_number.to_string(), subtopic_count, now),
        };
        entry.mark_subtopic(subtopic_index, subtopic_count, now);
        self.store.upsert_lesson(user_id, course_id, &entry).await?;
        let mut context = progress.context;
        context.note_understood(subtopic_name);
        self.store.save_context(user_id, course_id, &context, now).await?;
        self.store
            .set_subtopic_index(user_id, course_id, subtopic_index as i64 + 1, now)
            .await?;
        self.store.get_required(user_id, course_id).await
    }

    /// Sequencing: next lesson of the module in `greeting`, or the next
    /// module's first lesson behind a `quiz` gate, or the end of the course.
    pub async fn advance_to_next_lesson(
        &self,
        user_id: i64,
        course_id: i64,
    ) -> Result<AdvanceOutcome> {
        let lock = self.key_lock(user_id, course_id);
        let _guard = lock.lock().await;
        let progress = self.store.get_required(user_id, course_id).await?;
        if progress.course_completed {
            return Ok(AdvanceOutcome::CourseCompleted);
        }
        let target = {
            let course = self.catalog.get_course(course_id).await?;
            if course
                .lesson(progress.current_module, &progress.current_lesson)
                .is_none()
            {
                // stored position fell out of the catalog, e.g. after a
                // course restructure; advancing blindly could skip content
                return Err(Error::not_found(
                    "lesson",
                    format!(
                        "{course_id}/{}/{}",
                        progress.current_module, progress.current_lesson
                    ),
                ));
            }
            if let Some(next) =
                course.next_lesson_in_module(progress.current_module, &progress.current_lesson)
            {
                AdvanceTarget::NextLesson(progress.current_module, next.lesson_number.clone())
            } else {
                match course
                    .next_module(progress.current_module)
                    .and_then(|m| Some((m.module_number, m.lessons.first()?)))
                {
                    Some((module_number, lesson)) => {
                        AdvanceTarget::NextModule(module_number, lesson.lesson_number.clone())
                    }
                    None => AdvanceTarget::EndOfCourse,
                }
            }
        };
        let now = self.clock.now_utc();
        match target {
            AdvanceTarget::NextLesson(module_number, lesson_number) => {
                self.store
                    .set_position(
                        user_id,
                        course_id,
                        module_number,
                        &lesson_number,
                        0,
                        TeachingState::Greeting,
                        now,
                    )
                    .await?;
                Ok(AdvanceOutcome::Advanced)
            }
            AdvanceTarget::NextModule(module_number, lesson_number) => {
                // module boundaries always gate on a quiz before new content
                self.store
                    .set_position(
                        user_id,
                        course_id,
                        module_number,
                        &lesson_number,
                        0,
                        TeachingState::Quiz,
                        now,
                    )
                    .await?;
                Ok(AdvanceOutcome::ModuleCompleted)
            }
            AdvanceTarget::EndOfCourse => {
                self.store.mark_course_completed(user_id, course_id, now).await?;
                Ok(AdvanceOutcome::CourseCompleted)
            }
        }
    }

    /// Store a quiz outcome as reported; pass/fail policy belongs to the
    /// caller. Returns the stored record with the attempt counter the store
    /// maintains.
    pub async fn save_quiz_result(
        &self,
        user_id: i64,
        course_id: i64,
        mut result: ModuleQuizResult,
    ) -> Result<ModuleQuizResult> {
        let lock = self.key_lock(user_id, course_id);
        let _guard = lock.lock().await;
        {
            let course = self.catalog.get_course(course_id).await?;
            if course.module(result.module_number).is_none() {
                return Err(Error::not_found(
                    "module",
                    format!("{course_id}/{}", result.module_number),
                ));
            }
        }
        self.store.ensure_exists(user_id, course_id).await?;
        result.taken_at = self.clock.now_utc();
        self.store.save_quiz_result(user_id, course_id, &result).await?;
        let stored = self
            .store
            .quiz_results(user_id, course_id)
            .await?
            .into_iter()
            .find(|r| r.module_number == result.module_number)
            .ok_or_else(|| Error::not_found("quiz result", result.module_number))?;
        Ok(stored)
    }

    /// Derived read: completion counts against catalog totals plus the
    /// learner's streak. Averages only the entries that carry a score.
    pub async fn progress_summary(&self, user_id: i64, course_id: i64) -> Result<ProgressSummary> {
        let progress = self.store.get_required(user_id, course_id).await?;
        let learner = self.directory.learner_profile(user_id).await?;
        let (total_modules, total_lessons, completed_modules) = {
            let course = self.catalog.get_course(course_id).await?;
            let completed_modules = course
                .modules
                .iter()
                .filter(|module| {
                    !module.lessons.is_empty()
                        && module.lessons.iter().all(|lesson| {
                            progress
                                .lessons
                                .get(&(module.module_number, lesson.lesson_number.clone()))
                                .is_some_and(|entry| entry.status == LessonStatus::Completed)
                        })
                })
                .count();
            (course.module_count(), course.lesson_count(), completed_modules)
        };
        let completed_lessons = progress
            .lessons
            .values()
            .filter(|entry| entry.status == LessonStatus::Completed)
            .count();
        let completion_percent = if total_lessons == 0 {
            0.0
        } else {
            completed_lessons as f64 / total_lessons as f64 * 100.0
        };
        let scores: Vec<i64> = progress
            .lessons
            .values()
            .filter_map(|entry| entry.understanding_score)
            .collect();
        let average_understanding = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<i64>() as f64 / scores.len() as f64
        };
        Ok(ProgressSummary {
            user_id,
            course_id,
            total_modules,
            total_lessons,
            completed_lessons,
            completed_modules,
            completion_percent,
            average_understanding,
            current_streak: learner.current_streak,
            course_completed: progress.course_completed,
        })
    }

    /// Completion days are compared in the learner's zone. A learner with a
    /// broken zone string still gets their completion counted, just on UTC
    /// days.
    async fn record_streak_day(&self, user_id: i64) -> Result<()> {
        let learner = self.directory.learner_profile(user_id).await?;
        let zone = match learner.timezone.parse::<Tz>() {
            Ok(zone) => zone,
            Err(_) => {
                warn!(
                    "learner {} has invalid timezone {:?}, falling back to UTC for streak days",
                    user_id, learner.timezone
                );
                chrono_tz::UTC
            }
        };
        let today = self.clock.now_utc().with_timezone(&zone).date_naive();
        let mut streak = learner.streak();
        streak.record_completion(today);
        self.directory.update_streak(user_id, streak).await
    }
}
