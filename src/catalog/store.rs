use std::path::Path;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::one::Ref;
use sqlx::SqlitePool;
use tracing::{error, info};

use super::course::{Course, CourseSchedule};
use crate::error::{Error, Result};

/// Read-mostly course catalog: durable rows plus an in-process cache
/// loaded on first access.
#[derive(Debug, Clone)]
pub struct Catalog {
    courses: DashMap<i64, Course>,
    database: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct CourseRow {
    id: i64,
    title: String,
    description: Option<String>,
    modules: String,
}

impl CourseRow {
    fn into_course(self) -> Result<Course> {
        Ok(Course {
            id: self.id,
            title: self.title,
            description: self.description,
            modules: serde_json::from_str(&self.modules)
                .map_err(|e| Error::decode("course modules", e))?,
        })
    }
}

impl Catalog {
    pub async fn new(database: SqlitePool) -> Result<Self> {
        let catalog = Self {
            courses: DashMap::new(),
            database,
        };
        catalog.load_courses_from_db().await?;
        Ok(catalog)
    }

    pub async fn get_course(&self, id: i64) -> Result<Ref<'_, i64, Course>> {
        if let Some(course) = self.courses.get(&id) {
            return Ok(course);
        }
        self.load_course_from_db(id).await?;
        self.courses
            .get(&id)
            .ok_or_else(|| Error::not_found("course", id))
    }

    async fn load_course_from_db(&self, id: i64) -> Result<()> {
        let row = sqlx::query_as::<_, CourseRow>(
            "SELECT id, title, description, modules FROM course WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.database)
        .await?
        .ok_or_else(|| Error::not_found("course", id))?;
        self.courses.insert(id, row.into_course()?);
        Ok(())
    }

    async fn load_courses_from_db(&self) -> Result<()> {
        let rows = sqlx::query_as::<_, CourseRow>("SELECT id, title, description, modules FROM course")
            .fetch_all(&self.database)
            .await?;
        for row in rows {
            let id = row.id;
            match row.into_course() {
                Ok(course) => {
                    self.courses.insert(id, course);
                }
                Err(e) => {
                    error!("load course {} failed: {}", id, e);
                    continue;
                }
            }
        }
        Ok(())
    }

    pub async fn upsert_course(&self, course: &Course) -> Result<()> {
        let modules = serde_json::to_string(&course.modules)?;
        sqlx::query(
            "REPLACE INTO course (id, title, description, modules, update_time) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(course.id)
        .bind(&course.title)
        .bind(&course.description)
        .bind(modules)
        .bind(Utc::now())
        .execute(&self.database)
        .await?;
        self.courses.insert(course.id, course.clone());
        Ok(())
    }

    pub async fn course_list(&self) -> Result<Vec<Course>> {
        let rows = sqlx::query_as::<_, CourseRow>(
            "SELECT id, title, description, modules FROM course ORDER BY id",
        )
        .fetch_all(&self.database)
        .await?;
        rows.into_iter().map(CourseRow::into_course).collect()
    }

    /// Load one course definition file. Files without an explicit id get a
    /// content-derived one, so re-importing the same file stays stable.
    pub async fn import_course_file(&self, path: impl AsRef<Path>) -> anyhow::Result<i64> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let mut course: Course = toml::from_str(&content)?;
        if course.id == 0 {
            course.id = course.stable_id();
        }
        self.upsert_course(&course).await?;
        info!("imported course {}-{} from {}", course.id, course.title, path.display());
        Ok(course.id)
    }

    /// Scan a directory of course definition files. One bad file must not
    /// abort the rest of the import.
    pub async fn import_course_dir(&self, dir: impl AsRef<Path>) -> anyhow::Result<usize> {
        let mut imported = 0;
        let mut entries = tokio::fs::read_dir(dir.as_ref()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "toml") {
                continue;
            }
            match self.import_course_file(&path).await {
                Ok(_) => imported += 1,
                Err(e) => {
                    error!("import course {} failed: {}", path.display(), e);
                }
            }
        }
        Ok(imported)
    }

    pub async fn upsert_enrollment(&self, schedule: &CourseSchedule) -> Result<()> {
        sqlx::query(
            "REPLACE INTO enrollment (user_id, course_id, daily_slot_time, timezone, start_date, target_completion, notifications_enabled) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(schedule.user_id)
        .bind(schedule.course_id)
        .bind(&schedule.daily_slot_time)
        .bind(&schedule.timezone)
        .bind(schedule.start_date)
        .bind(schedule.target_completion)
        .bind(schedule.notifications_enabled)
        .execute(&self.database)
        .await?;
        Ok(())
    }

    pub async fn enrollment(&self, user_id: i64, course_id: i64) -> Result<CourseSchedule> {
        sqlx::query_as::<_, CourseSchedule>(
            "SELECT user_id, course_id, daily_slot_time, timezone, start_date, target_completion, notifications_enabled \
             FROM enrollment WHERE user_id = ? AND course_id = ?",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_optional(&self.database)
        .await?
        .ok_or_else(|| Error::not_found("enrollment", format!("{user_id}/{course_id}")))
    }

    /// Enrollments the daily generation sweep should visit.
    pub async fn active_schedules(&self) -> Result<Vec<CourseSchedule>> {
        let schedules = sqlx::query_as::<_, CourseSchedule>(
            "SELECT user_id, course_id, daily_slot_time, timezone, start_date, target_completion, notifications_enabled \
             FROM enrollment WHERE notifications_enabled = 1 AND daily_slot_time IS NOT NULL \
             ORDER BY user_id, course_id",
        )
        .fetch_all(&self.database)
        .await?;
        Ok(schedules)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::catalog::course::{Lesson, Module};
    use crate::store::memory_pool;

    fn small_course(id: i64, title: &str) -> Course {
        Course {
            id,
            title: title.to_string(),
            description: Some("test".to_string()),
            modules: vec![Module {
                module_number: 1,
                title: "Only".to_string(),
                lessons: vec![Lesson {
                    lesson_number: "1.1".to_string(),
                    title: "Start".to_string(),
                    subtopics: vec!["first".to_string()],
                }],
            }],
        }
    }

    fn enrollment(user_id: i64, course_id: i64, enabled: bool, slot: Option<&str>) -> CourseSchedule {
        CourseSchedule {
            user_id,
            course_id,
            daily_slot_time: slot.map(String::from),
            timezone: None,
            start_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            target_completion: None,
            notifications_enabled: enabled,
        }
    }

    #[tokio::test]
    async fn get_course_loads_from_db_on_cache_miss() {
        let pool = memory_pool().await;
        let catalog = Catalog::new(pool.clone()).await.unwrap();
        catalog.upsert_course(&small_course(11, "Cached")).await.unwrap();
        // a second catalog over the same pool starts with a cold cache
        let other = Catalog {
            courses: DashMap::new(),
            database: pool,
        };
        let course = other.get_course(11).await.unwrap();
        assert_eq!(course.title, "Cached");
        assert_eq!(course.modules.len(), 1);
    }

    #[tokio::test]
    async fn course_list_is_ordered_by_id() {
        let pool = memory_pool().await;
        let catalog = Catalog::new(pool).await.unwrap();
        catalog.upsert_course(&small_course(20, "Second")).await.unwrap();
        catalog.upsert_course(&small_course(10, "First")).await.unwrap();
        let courses = catalog.course_list().await.unwrap();
        assert_eq!(courses.len(), 2);
        assert_eq!(courses[0].title, "First");
        assert_eq!(courses[1].title, "Second");
    }

    #[tokio::test]
    async fn missing_course_is_not_found() {
        let pool = memory_pool().await;
        let catalog = Catalog::new(pool).await.unwrap();
        let err = catalog.get_course(404).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn import_dir_skips_broken_files() {
        let pool = memory_pool().await;
        let catalog = Catalog::new(pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("good.toml"),
            "title = \"Good\"\n[[modules]]\nmodule_number = 1\ntitle = \"M\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("bad.toml"), "title = ").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let imported = catalog.import_course_dir(dir.path()).await.unwrap();
        assert_eq!(imported, 1);
    }

    #[tokio::test]
    async fn reimporting_same_file_keeps_the_same_id() {
        let pool = memory_pool().await;
        let catalog = Catalog::new(pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("course.toml");
        std::fs::write(&path, "title = \"Stable\"\n").unwrap();
        let first = catalog.import_course_file(&path).await.unwrap();
        let second = catalog.import_course_file(&path).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn active_schedules_filters_disabled_and_slotless() {
        let pool = memory_pool().await;
        let catalog = Catalog::new(pool).await.unwrap();
        catalog.upsert_enrollment(&enrollment(1, 7, true, Some("09:00"))).await.unwrap();
        catalog.upsert_enrollment(&enrollment(2, 7, false, Some("09:00"))).await.unwrap();
        catalog.upsert_enrollment(&enrollment(3, 7, true, None)).await.unwrap();
        let active = catalog.active_schedules().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, 1);
        let fetched = catalog.enrollment(2, 7).await.unwrap();
        assert!(!fetched.notifications_enabled);
        assert!(catalog.enrollment(9, 9).await.unwrap_err().is_not_found());
    }
}
