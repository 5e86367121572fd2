pub mod course;
pub mod store;

pub use course::{Course, CourseSchedule, Lesson, Module};
pub use store::Catalog;
