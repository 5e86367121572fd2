use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Phase of a teaching session. `AnsweringQuestion` interrupts any
/// non-terminal phase and remembers where to go back via
/// [`LearningProgress::return_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeachingState {
    Greeting,
    Explaining,
    CheckingUnderstanding,
    AnsweringQuestion,
    Quiz,
    Transitioning,
    Completed,
}

impl TeachingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeachingState::Greeting => "greeting",
            TeachingState::Explaining => "explaining",
            TeachingState::CheckingUnderstanding => "checking_understanding",
            TeachingState::AnsweringQuestion => "answering_question",
            TeachingState::Quiz => "quiz",
            TeachingState::Transitioning => "transitioning",
            TeachingState::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TeachingState::Completed)
    }
}

impl fmt::Display for TeachingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TeachingState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greeting" => Ok(TeachingState::Greeting),
            "explaining" => Ok(TeachingState::Explaining),
            "checking_understanding" => Ok(TeachingState::CheckingUnderstanding),
            "answering_question" => Ok(TeachingState::AnsweringQuestion),
            "quiz" => Ok(TeachingState::Quiz),
            "transitioning" => Ok(TeachingState::Transitioning),
            "completed" => Ok(TeachingState::Completed),
            other => Err(Error::decode("teaching state", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    NotStarted,
    InProgress,
    QuizPending,
    Completed,
}

impl LessonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LessonStatus::NotStarted => "not_started",
            LessonStatus::InProgress => "in_progress",
            LessonStatus::QuizPending => "quiz_pending",
            LessonStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LessonStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(LessonStatus::NotStarted),
            "in_progress" => Ok(LessonStatus::InProgress),
            "quiz_pending" => Ok(LessonStatus::QuizPending),
            "completed" => Ok(LessonStatus::Completed),
            other => Err(Error::decode("lesson status", other)),
        }
    }
}

/// Per-lesson record. At most one exists per (module, lesson) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonProgress {
    pub module_number: i64,
    pub lesson_number: String,
    pub status: LessonStatus,
    /// One flag per subtopic of the catalog lesson.
    pub subtopics_completed: Vec<bool>,
    /// 0-100, absent until a score has been reported.
    pub understanding_score: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub update_time: DateTime<Utc>,
}

impl LessonProgress {
    pub fn new(
        module_number: i64,
        lesson_number: String,
        subtopic_count: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            module_number,
            lesson_number,
            status: LessonStatus::InProgress,
            subtopics_completed: vec![false; subtopic_count],
            understanding_score: None,
            started_at: now,
            completed_at: None,
            update_time: now,
        }
    }

    /// Apply only the fields present in the patch. Entering `completed`
    /// stamps `completed_at` once; later completions keep the first stamp.
    pub fn merge(&mut self, patch: LessonPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
            if status == LessonStatus::Completed && self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
        }
        if let Some(flags) = patch.subtopics_completed {
            self.subtopics_completed = flags;
        }
        if let Some(score) = patch.understanding_score {
            self.understanding_score = Some(score);
        }
        self.update_time = now;
    }

    pub fn mark_subtopic(&mut self, index: usize, subtopic_count: usize, now: DateTime<Utc>) {
        if self.subtopics_completed.len() != subtopic_count {
            self.subtopics_completed.resize(subtopic_count, false);
        }
        if let Some(flag) = self.subtopics_completed.get_mut(index) {
            *flag = true;
        }
        self.update_time = now;
    }
}

/// Partial update for [`LessonProgress`]; absent fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LessonPatch {
    pub status: Option<LessonStatus>,
    pub subtopics_completed: Option<Vec<bool>>,
    pub understanding_score: Option<i64>,
}

/// Latest quiz outcome for a module. Saving again overwrites the outcome
/// while the attempt count keeps growing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleQuizResult {
    pub module_number: i64,
    /// 0-100. Whether it passes is the caller's policy, not this core's.
    pub score: i64,
    pub passed: bool,
    pub attempts: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub review_topics: Vec<String>,
    pub taken_at: DateTime<Utc>,
}

/// Append-only account of what the learner grasped or fought with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeachingContext {
    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub understood_concepts: BTreeSet<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub struggling_areas: BTreeSet<String>,
    pub last_topic: Option<String>,
}

impl TeachingContext {
    pub fn merge(&mut self, other: TeachingContext) {
        self.understood_concepts.extend(other.understood_concepts);
        self.struggling_areas.extend(other.struggling_areas);
        if other.last_topic.is_some() {
            self.last_topic = other.last_topic;
        }
    }

    pub fn note_understood(&mut self, topic: impl Into<String>) {
        let topic = topic.into();
        self.understood_concepts.insert(topic.clone());
        self.last_topic = Some(topic);
    }

    pub fn note_struggling(&mut self, topic: impl Into<String>) {
        let topic = topic.into();
        self.struggling_areas.insert(topic.clone());
        self.last_topic = Some(topic);
    }
}

/// Full progress aggregate for one (user, course) pair.
#[derive(Debug, Clone)]
pub struct LearningProgress {
    pub user_id: i64,
    pub course_id: i64,
    pub current_module: i64,
    pub current_lesson: String,
    pub current_subtopic_index: i64,
    pub teaching_state: TeachingState,
    /// State interrupted by `AnsweringQuestion`, depth one.
    pub return_state: Option<TeachingState>,
    pub course_completed: bool,
    pub context: TeachingContext,
    pub lessons: BTreeMap<(i64, String), LessonProgress>,
    pub quiz_results: BTreeMap<i64, ModuleQuizResult>,
    pub started_at: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSummary {
    pub user_id: i64,
    pub course_id: i64,
    pub total_modules: usize,
    pub total_lessons: usize,
    pub completed_lessons: usize,
    pub completed_modules: usize,
    pub completion_percent: f64,
    pub average_understanding: f64,
    pub current_streak: i64,
    pub course_completed: bool,
}

/// What `advance_to_next_lesson` did, so callers can branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Moved to the next lesson of the same module.
    Advanced,
    /// Crossed a module boundary; the session now gates on a quiz.
    ModuleCompleted,
    /// No further lesson exists; the course is finished for this learner.
    CourseCompleted,
}
