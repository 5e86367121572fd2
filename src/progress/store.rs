use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::types::{
    LearningProgress, LessonProgress, ModuleQuizResult, TeachingContext, TeachingState,
};
use crate::error::{Error, Result};

/// Durable per-(user, course) progress records. All writes that span more
/// than one field go through the engine, which serializes them per key.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    database: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    user_id: i64,
    course_id: i64,
    current_module: i64,
    current_lesson: String,
    current_subtopic_index: i64,
    teaching_state: String,
    return_state: Option<String>,
    course_completed: bool,
    understood_concepts: String,
    struggling_areas: String,
    last_topic: Option<String>,
    started_at: DateTime<Utc>,
    update_time: DateTime<Utc>,
}

impl ProgressRow {
    fn into_progress(
        self,
        lessons: Vec<LessonProgress>,
        quiz_results: Vec<ModuleQuizResult>,
    ) -> Result<LearningProgress> {
        let context = TeachingContext {
            understood_concepts: serde_json::from_str(&self.understood_concepts)?,
            struggling_areas: serde_json::from_str(&self.struggling_areas)?,
            last_topic: self.last_topic,
        };
        let return_state = match self.return_state.as_deref() {
            Some(s) => Some(s.parse()?),
            None => None,
        };
        Ok(LearningProgress {
            user_id: self.user_id,
            course_id: self.course_id,
            current_module: self.current_module,
            current_lesson: self.current_lesson,
            current_subtopic_index: self.current_subtopic_index,
            teaching_state: self.teaching_state.parse()?,
            return_state,
            course_completed: self.course_completed,
            context,
            lessons: lessons
                .into_iter()
                .map(|l| ((l.module_number, l.lesson_number.clone()), l))
                .collect(),
            quiz_results: quiz_results
                .into_iter()
                .map(|q| (q.module_number, q))
                .collect::<BTreeMap<_, _>>(),
            started_at: self.started_at,
            update_time: self.update_time,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LessonRow {
    module_number: i64,
    lesson_number: String,
    status: String,
    subtopics_completed: String,
    understanding_score: Option<i64>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    update_time: DateTime<Utc>,
}

impl LessonRow {
    fn into_lesson(self) -> Result<LessonProgress> {
        Ok(LessonProgress {
            module_number: self.module_number,
            lesson_number: self.lesson_number,
            status: self.status.parse()?,
            subtopics_completed: serde_json::from_str(&self.subtopics_completed)?,
            understanding_score: self.understanding_score,
            started_at: self.started_at,
            completed_at: self.completed_at,
            update_time: self.update_time,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QuizRow {
    module_number: i64,
    score: i64,
    passed: bool,
    attempts: i64,
    review_topics: String,
    taken_at: DateTime<Utc>,
}

impl QuizRow {
    fn into_result(self) -> Result<ModuleQuizResult> {
        Ok(ModuleQuizResult {
            module_number: self.module_number,
            score: self.score,
            passed: self.passed,
            attempts: self.attempts,
            review_topics: serde_json::from_str(&self.review_topics)?,
            taken_at: self.taken_at,
        })
    }
}

impl ProgressStore {
    pub fn new(database: SqlitePool) -> Self {
        Self { database }
    }

    /// Upsert-style creation; racing callers for the same key leave exactly
    /// one row behind and never clobber an existing one.
    pub async fn create_if_absent(
        &self,
        user_id: i64,
        course_id: i64,
        module_number: i64,
        lesson_number: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO learning_progress \
             (user_id, course_id, current_module, current_lesson, current_subtopic_index, teaching_state, started_at, update_time) \
             VALUES (?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(course_id)
        .bind(module_number)
        .bind(lesson_number)
        .bind(TeachingState::Greeting.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.database)
        .await?;
        Ok(())
    }

    pub async fn get(&self, user_id: i64, course_id: i64) -> Result<Option<LearningProgress>> {
        let row = sqlx::query_as::<_, ProgressRow>(
            "SELECT user_id, course_id, current_module, current_lesson, current_subtopic_index, \
             teaching_state, return_state, course_completed, understood_concepts, struggling_areas, \
             last_topic, started_at, update_time \
             FROM learning_progress WHERE user_id = ? AND course_id = ?",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_optional(&self.database)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let lessons = self.lessons(user_id, course_id).await?;
        let quiz_results = self.quiz_results(user_id, course_id).await?;
        Ok(Some(row.into_progress(lessons, quiz_results)?))
    }

    pub async fn get_required(&self, user_id: i64, course_id: i64) -> Result<LearningProgress> {
        self.get(user_id, course_id)
            .await?
            .ok_or_else(|| Error::not_found("progress", format!("{user_id}/{course_id}")))
    }

    pub async fn ensure_exists(&self, user_id: i64, course_id: i64) -> Result<()> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM learning_progress WHERE user_id = ? AND course_id = ?",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_one(&self.database)
        .await?;
        if count == 0 {
            return Err(Error::not_found("progress", format!("{user_id}/{course_id}")));
        }
        Ok(())
    }

    pub async fn set_teaching_state(
        &self,
        user_id: i64,
        course_id: i64,
        state: TeachingState,
        return_state: Option<TeachingState>,
        current_subtopic: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE learning_progress SET teaching_state = ?, return_state = ?, \
             current_subtopic_index = COALESCE(?, current_subtopic_index), update_time = ? \
             WHERE user_id = ? AND course_id = ?",
        )
        .bind(state.as_str())
        .bind(return_state.map(|s| s.as_str()))
        .bind(current_subtopic)
        .bind(now)
        .bind(user_id)
        .bind(course_id)
        .execute(&self.database)
        .await?;
        Ok(())
    }

    pub async fn set_subtopic_index(
        &self,
        user_id: i64,
        course_id: i64,
        index: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE learning_progress SET current_subtopic_index = ?, update_time = ? \
             WHERE user_id = ? AND course_id = ?",
        )
        .bind(index)
        .bind(now)
        .bind(user_id)
        .bind(course_id)
        .execute(&self.database)
        .await?;
        Ok(())
    }

    /// Move the current position; always lands at subtopic `subtopic_index`
    /// of the target lesson and drops any pending question return.
    pub async fn set_position(
        &self,
        user_id: i64,
        course_id: i64,
        module_number: i64,
        lesson_number: &str,
        subtopic_index: i64,
        state: TeachingState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE learning_progress SET current_module = ?, current_lesson = ?, \
             current_subtopic_index = ?, teaching_state = ?, return_state = NULL, update_time = ? \
             WHERE user_id = ? AND course_id = ?",
        )
        .bind(module_number)
        .bind(lesson_number)
        .bind(subtopic_index)
        .bind(state.as_str())
        .bind(now)
        .bind(user_id)
        .bind(course_id)
        .execute(&self.database)
        .await?;
        Ok(())
    }

    pub async fn mark_course_completed(
        &self,
        user_id: i64,
        course_id: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE learning_progress SET course_completed = 1, teaching_state = ?, \
             return_state = NULL, update_time = ? WHERE user_id = ? AND course_id = ?",
        )
        .bind(TeachingState::Completed.as_str())
        .bind(now)
        .bind(user_id)
        .bind(course_id)
        .execute(&self.database)
        .await?;
        Ok(())
    }

    pub async fn save_context(
        &self,
        user_id: i64,
        course_id: i64,
        context: &TeachingContext,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE learning_progress SET understood_concepts = ?, struggling_areas = ?, \
             last_topic = ?, update_time = ? WHERE user_id = ? AND course_id = ?",
        )
        .bind(serde_json::to_string(&context.understood_concepts)?)
        .bind(serde_json::to_string(&context.struggling_areas)?)
        .bind(&context.last_topic)
        .bind(now)
        .bind(user_id)
        .bind(course_id)
        .execute(&self.database)
        .await?;
        Ok(())
    }

    pub async fn get_lesson(
        &self,
        user_id: i64,
        course_id: i64,
        module_number: i64,
        lesson_number: &str,
    ) -> Result<Option<LessonProgress>> {
        let row = sqlx::query_as::<_, LessonRow>(
            "SELECT module_number, lesson_number, status, subtopics_completed, understanding_score, \
             started_at, completed_at, update_time \
             FROM lesson_progress \
             WHERE user_id = ? AND course_id = ? AND module_number = ? AND lesson_number = ?",
        )
        .bind(user_id)
        .bind(course_id)
        .bind(module_number)
        .bind(lesson_number)
        .fetch_optional(&self.database)
        .await?;
        row.map(LessonRow::into_lesson).transpose()
    }

    pub async fn upsert_lesson(
        &self,
        user_id: i64,
        course_id: i64,
        lesson: &LessonProgress,
    ) -> Result<()> {
        sqlx::query(
            "REPLACE INTO lesson_progress \
             (user_id, course_id, module_number, lesson_number, status, subtopics_completed, \
              understanding_score, started_at, completed_at, update_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(course_id)
        .bind(lesson.module_number)
        .bind(&lesson.lesson_number)
        .bind(lesson.status.as_str())
        .bind(serde_json::to_string(&lesson.subtopics_completed)?)
        .bind(lesson.understanding_score)
        .bind(lesson.started_at)
        .bind(lesson.completed_at)
        .bind(lesson.update_time)
        .execute(&self.database)
        .await?;
        Ok(())
    }

    pub async fn lessons(&self, user_id: i64, course_id: i64) -> Result<Vec<LessonProgress>> {
        let rows = sqlx::query_as::<_, LessonRow>(
            "SELECT module_number, lesson_number, status, subtopics_completed, understanding_score, \
             started_at, completed_at, update_time \
             FROM lesson_progress WHERE user_id = ? AND course_id = ? \
             ORDER BY module_number, lesson_number",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_all(&self.database)
        .await?;
        rows.into_iter().map(LessonRow::into_lesson).collect()
    }

    /// Latest-wins upsert keyed by module number; only the attempt counter
    /// survives across saves.
    pub async fn save_quiz_result(
        &self,
        user_id: i64,
        course_id: i64,
        result: &ModuleQuizResult,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO module_quiz_result \
             (user_id, course_id, module_number, score, passed, attempts, review_topics, taken_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?) \
             ON CONFLICT(user_id, course_id, module_number) DO UPDATE SET \
             score = excluded.score, passed = excluded.passed, \
             attempts = module_quiz_result.attempts + 1, \
             review_topics = excluded.review_topics, taken_at = excluded.taken_at",
        )
        .bind(user_id)
        .bind(course_id)
        .bind(result.module_number)
        .bind(result.score)
        .bind(result.passed)
        .bind(serde_json::to_string(&result.review_topics)?)
        .bind(result.taken_at)
        .execute(&self.database)
        .await?;
        Ok(())
    }

    pub async fn quiz_results(&self, user_id: i64, course_id: i64) -> Result<Vec<ModuleQuizResult>> {
        let rows = sqlx::query_as::<_, QuizRow>(
            "SELECT module_number, score, passed, attempts, review_topics, taken_at \
             FROM module_quiz_result WHERE user_id = ? AND course_id = ? ORDER BY module_number",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_all(&self.database)
        .await?;
        rows.into_iter().map(QuizRow::into_result).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::store::memory_pool;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 20, h, 0, 0).unwrap()
    }

    async fn store_with_progress() -> ProgressStore {
        let store = ProgressStore::new(memory_pool().await);
        store.create_if_absent(1, 7, 1, "1.1", at(9)).await.unwrap();
        store
    }

    mod creation_tests {
        use super::*;

        #[tokio::test]
        async fn create_if_absent_never_clobbers() {
            let store = store_with_progress().await;
            store
                .set_teaching_state(1, 7, TeachingState::Explaining, None, Some(2), at(10))
                .await
                .unwrap();
            // a second create for the same key is ignored
            store.create_if_absent(1, 7, 1, "1.1", at(11)).await.unwrap();
            let progress = store.get_required(1, 7).await.unwrap();
            assert_eq!(progress.teaching_state, TeachingState::Explaining);
            assert_eq!(progress.current_subtopic_index, 2);
            assert_eq!(progress.started_at, at(9));
        }

        #[tokio::test]
        async fn fresh_progress_starts_greeting_at_subtopic_zero() {
            let store = store_with_progress().await;
            let progress = store.get_required(1, 7).await.unwrap();
            assert_eq!(progress.current_module, 1);
            assert_eq!(progress.current_lesson, "1.1");
            assert_eq!(progress.current_subtopic_index, 0);
            assert_eq!(progress.teaching_state, TeachingState::Greeting);
            assert_eq!(progress.return_state, None);
            assert!(!progress.course_completed);
            assert!(progress.lessons.is_empty());
            assert!(progress.quiz_results.is_empty());
        }

        #[tokio::test]
        async fn missing_progress_is_not_found() {
            let store = ProgressStore::new(memory_pool().await);
            assert!(store.get(9, 9).await.unwrap().is_none());
            assert!(store.get_required(9, 9).await.unwrap_err().is_not_found());
            assert!(store.ensure_exists(9, 9).await.unwrap_err().is_not_found());
        }
    }

    mod lesson_tests {
        use super::*;

        #[tokio::test]
        async fn lesson_roundtrip_preserves_flags_and_stamps() {
            let store = store_with_progress().await;
            let mut entry = LessonProgress::new(1, "1.1".to_string(), 3, at(9));
            entry.subtopics_completed[1] = true;
            entry.understanding_score = Some(90);
            store.upsert_lesson(1, 7, &entry).await.unwrap();
            let loaded = store.get_lesson(1, 7, 1, "1.1").await.unwrap().unwrap();
            assert_eq!(loaded.subtopics_completed, vec![false, true, false]);
            assert_eq!(loaded.understanding_score, Some(90));
            assert_eq!(loaded.started_at, at(9));
            assert_eq!(loaded.completed_at, None);
        }

        #[tokio::test]
        async fn aggregate_carries_lessons_keyed_by_module_and_lesson() {
            let store = store_with_progress().await;
            store
                .upsert_lesson(1, 7, &LessonProgress::new(1, "1.1".to_string(), 2, at(9)))
                .await
                .unwrap();
            store
                .upsert_lesson(1, 7, &LessonProgress::new(1, "1.2".to_string(), 1, at(10)))
                .await
                .unwrap();
            let progress = store.get_required(1, 7).await.unwrap();
            assert_eq!(progress.lessons.len(), 2);
            assert!(progress.lessons.contains_key(&(1, "1.2".to_string())));
        }
    }

    mod quiz_tests {
        use super::*;

        fn result(module_number: i64, score: i64, passed: bool) -> ModuleQuizResult {
            ModuleQuizResult {
                module_number,
                score,
                passed,
                attempts: 1,
                review_topics: vec![],
                taken_at: at(12),
            }
        }

        #[tokio::test]
        async fn same_module_keeps_latest_and_counts_attempts() {
            let store = store_with_progress().await;
            store.save_quiz_result(1, 7, &result(1, 55, false)).await.unwrap();
            let mut retake = result(1, 85, true);
            retake.review_topics = vec!["bearings".to_string()];
            store.save_quiz_result(1, 7, &retake).await.unwrap();
            let results = store.quiz_results(1, 7).await.unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].score, 85);
            assert!(results[0].passed);
            assert_eq!(results[0].attempts, 2);
            assert_eq!(results[0].review_topics, vec!["bearings".to_string()]);
        }

        #[tokio::test]
        async fn different_modules_are_both_retained() {
            let store = store_with_progress().await;
            store.save_quiz_result(1, 7, &result(1, 80, true)).await.unwrap();
            store.save_quiz_result(1, 7, &result(2, 60, false)).await.unwrap();
            let progress = store.get_required(1, 7).await.unwrap();
            assert_eq!(progress.quiz_results.len(), 2);
            assert!(progress.quiz_results[&1].passed);
            assert!(!progress.quiz_results[&2].passed);
        }
    }

    mod context_tests {
        use super::*;

        #[tokio::test]
        async fn context_roundtrip() {
            let store = store_with_progress().await;
            let mut context = TeachingContext::default();
            context.note_understood("maps");
            context.note_struggling("bearings");
            store.save_context(1, 7, &context, at(10)).await.unwrap();
            let progress = store.get_required(1, 7).await.unwrap();
            assert_eq!(progress.context, context);
            assert_eq!(progress.context.last_topic.as_deref(), Some("bearings"));
        }
    }
}
