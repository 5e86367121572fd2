pub mod engine;
pub mod store;
pub mod types;

pub use engine::ProgressionEngine;
pub use store::ProgressStore;
pub use types::{
    AdvanceOutcome, LearningProgress, LessonPatch, LessonProgress, LessonStatus,
    ModuleQuizResult, ProgressSummary, TeachingContext, TeachingState,
};
