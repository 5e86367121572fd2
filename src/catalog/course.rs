use std::hash::{DefaultHasher, Hash, Hasher};

use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One teachable unit. The subtopic list is the teaching sequence an
/// external content service produced; this core only counts and indexes it.
#[derive(Debug, Clone, Serialize, Deserialize, Hash)]
pub struct Lesson {
    /// Opaque identifier like "1.2". Ordering comes from array position,
    /// never from parsing the string.
    pub lesson_number: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtopics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Hash)]
pub struct Module {
    pub module_number: i64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lessons: Vec<Lesson>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Hash)]
pub struct Course {
    #[serde(default)]
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<Module>,
}

impl Course {
    /// Stable id derived from content, used when a course definition file
    /// carries no explicit id.
    pub fn stable_id(&self) -> i64 {
        let mut hasher = DefaultHasher::new();
        self.title.hash(&mut hasher);
        self.description.hash(&mut hasher);
        self.modules.hash(&mut hasher);
        (hasher.finish() as i64).abs()
    }

    pub fn module(&self, module_number: i64) -> Option<&Module> {
        self.modules.iter().find(|m| m.module_number == module_number)
    }

    pub fn lesson(&self, module_number: i64, lesson_number: &str) -> Option<&Lesson> {
        self.module(module_number)?
            .lessons
            .iter()
            .find(|l| l.lesson_number == lesson_number)
    }

    /// Next lesson within the same module by array position.
    pub fn next_lesson_in_module(
        &self,
        module_number: i64,
        lesson_number: &str,
    ) -> Option<&Lesson> {
        let lessons = &self.module(module_number)?.lessons;
        let idx = lessons.iter().position(|l| l.lesson_number == lesson_number)?;
        lessons.get(idx + 1)
    }

    /// Module numbers advance strictly by +1; a gap ends the course.
    pub fn next_module(&self, module_number: i64) -> Option<&Module> {
        self.module(module_number + 1)
    }

    pub fn first_lesson(&self) -> Option<(i64, &Lesson)> {
        let module = self.modules.first()?;
        let lesson = module.lessons.first()?;
        Some((module.module_number, lesson))
    }

    pub fn subtopic_count(&self, module_number: i64, lesson_number: &str) -> Option<usize> {
        Some(self.lesson(module_number, lesson_number)?.subtopics.len())
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn lesson_count(&self) -> usize {
        self.modules.iter().map(|m| m.lessons.len()).sum()
    }
}

/// Daily study-slot configuration of one enrollment. Owned by the catalog;
/// the scheduling side only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CourseSchedule {
    pub user_id: i64,
    pub course_id: i64,
    /// Local wall-clock time "HH:MM"; no slot means no notifications.
    pub daily_slot_time: Option<String>,
    /// IANA zone name; falls back to the learner's zone when absent.
    pub timezone: Option<String>,
    pub start_date: NaiveDate,
    pub target_completion: Option<NaiveDate>,
    pub notifications_enabled: bool,
}

impl CourseSchedule {
    pub fn slot(&self) -> Result<Option<NaiveTime>> {
        let Some(raw) = self.daily_slot_time.as_deref() else {
            return Ok(None);
        };
        let slot = NaiveTime::parse_from_str(raw, "%H:%M")
            .map_err(|e| Error::invalid_schedule_key(format!("bad slot time {raw:?}: {e}")))?;
        Ok(Some(slot))
    }

    pub fn zone(&self, fallback: &str) -> Result<Tz> {
        let name = self.timezone.as_deref().unwrap_or(fallback);
        name.parse::<Tz>()
            .map_err(|e| Error::invalid_schedule_key(format!("bad timezone {name:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn two_module_course() -> Course {
        Course {
            id: 7,
            title: "Practical Navigation".to_string(),
            description: None,
            modules: vec![
                Module {
                    module_number: 1,
                    title: "Basics".to_string(),
                    lessons: vec![
                        Lesson {
                            lesson_number: "1.1".to_string(),
                            title: "Intro".to_string(),
                            subtopics: vec!["maps".to_string(), "compass".to_string()],
                        },
                        Lesson {
                            lesson_number: "1.2".to_string(),
                            title: "Bearings".to_string(),
                            subtopics: vec!["true north".to_string()],
                        },
                    ],
                },
                Module {
                    module_number: 2,
                    title: "Advanced".to_string(),
                    lessons: vec![Lesson {
                        lesson_number: "2.1".to_string(),
                        title: "Dead reckoning".to_string(),
                        subtopics: vec![],
                    }],
                },
            ],
        }
    }

    #[test]
    fn next_lesson_follows_array_order() {
        let course = two_module_course();
        let next = course.next_lesson_in_module(1, "1.1").unwrap();
        assert_eq!(next.lesson_number, "1.2");
        assert!(course.next_lesson_in_module(1, "1.2").is_none());
        assert!(course.next_lesson_in_module(2, "2.1").is_none());
    }

    #[test]
    fn array_order_wins_over_lexicographic_order() {
        let mut course = two_module_course();
        course.modules[0].lessons.push(Lesson {
            lesson_number: "1.10".to_string(),
            title: "Tenth".to_string(),
            subtopics: vec![],
        });
        // "1.10" sorts before "1.2" as a string; array position says otherwise
        let next = course.next_lesson_in_module(1, "1.2").unwrap();
        assert_eq!(next.lesson_number, "1.10");
    }

    #[test]
    fn next_module_requires_consecutive_numbering() {
        let mut course = two_module_course();
        assert_eq!(course.next_module(1).unwrap().module_number, 2);
        assert!(course.next_module(2).is_none());
        course.modules[1].module_number = 3;
        assert!(course.next_module(1).is_none());
    }

    #[test]
    fn first_lesson_and_totals() {
        let course = two_module_course();
        let (module, lesson) = course.first_lesson().unwrap();
        assert_eq!(module, 1);
        assert_eq!(lesson.lesson_number, "1.1");
        assert_eq!(course.module_count(), 2);
        assert_eq!(course.lesson_count(), 3);
        assert_eq!(course.subtopic_count(1, "1.1"), Some(2));
        assert_eq!(course.subtopic_count(2, "2.1"), Some(0));
        assert_eq!(course.subtopic_count(2, "9.9"), None);
    }

    #[test]
    fn stable_id_is_deterministic_and_content_sensitive() {
        let course = two_module_course();
        assert_eq!(course.stable_id(), course.stable_id());
        let mut renamed = course.clone();
        renamed.title = "Renamed".to_string();
        assert_ne!(course.stable_id(), renamed.stable_id());
    }

    #[test]
    fn course_parses_from_toml() {
        let course: Course = toml::from_str(
            r#"
            title = "Short Course"

            [[modules]]
            module_number = 1
            title = "Only"

            [[modules.lessons]]
            lesson_number = "1.1"
            title = "Start"
            subtopics = ["a", "b"]
            "#,
        )
        .unwrap();
        assert_eq!(course.id, 0);
        assert_eq!(course.modules.len(), 1);
        assert_eq!(course.modules[0].lessons[0].subtopics.len(), 2);
    }

    mod schedule_tests {
        use super::*;

        fn schedule(slot: Option<&str>, zone: Option<&str>) -> CourseSchedule {
            CourseSchedule {
                user_id: 1,
                course_id: 7,
                daily_slot_time: slot.map(String::from),
                timezone: zone.map(String::from),
                start_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                target_completion: None,
                notifications_enabled: true,
            }
        }

        #[test]
        fn slot_parses_wall_clock_time() {
            let s = schedule(Some("09:30"), None);
            assert_eq!(s.slot().unwrap(), NaiveTime::from_hms_opt(9, 30, 0));
            assert!(schedule(None, None).slot().unwrap().is_none());
        }

        #[test]
        fn malformed_slot_is_invalid_schedule_key() {
            let err = schedule(Some("9h30"), None).slot().unwrap_err();
            assert!(matches!(err, Error::InvalidScheduleKey { .. }));
        }

        #[test]
        fn zone_prefers_enrollment_over_fallback() {
            let s = schedule(Some("09:30"), Some("America/New_York"));
            assert_eq!(s.zone("UTC").unwrap(), chrono_tz::America::New_York);
            let s = schedule(Some("09:30"), None);
            assert_eq!(s.zone("Europe/Berlin").unwrap(), chrono_tz::Europe::Berlin);
        }

        #[test]
        fn unknown_zone_is_invalid_schedule_key() {
            let err = schedule(Some("09:30"), Some("Mars/Olympus")).zone("UTC").unwrap_err();
            assert!(matches!(err, Error::InvalidScheduleKey { .. }));
        }
    }
}
