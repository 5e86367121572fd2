use std::path::Path;

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS course (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT,
    modules TEXT NOT NULL,
    update_time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS learner (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    reminder_minutes_before INTEGER NOT NULL DEFAULT 30,
    current_streak INTEGER NOT NULL DEFAULT 0,
    longest_streak INTEGER NOT NULL DEFAULT 0,
    last_streak_update TEXT
);

CREATE TABLE IF NOT EXISTS enrollment (
    user_id INTEGER NOT NULL,
    course_id INTEGER NOT NULL,
    daily_slot_time TEXT,
    timezone TEXT,
    start_date TEXT NOT NULL,
    target_completion TEXT,
    notifications_enabled INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (user_id, course_id)
);

CREATE TABLE IF NOT EXISTS learning_progress (
    user_id INTEGER NOT NULL,
    course_id INTEGER NOT NULL,
    current_module INTEGER NOT NULL,
    current_lesson TEXT NOT NULL,
    current_subtopic_index INTEGER NOT NULL DEFAULT 0,
    teaching_state TEXT NOT NULL,
    return_state TEXT,
    course_completed INTEGER NOT NULL DEFAULT 0,
    understood_concepts TEXT NOT NULL DEFAULT '[]',
    struggling_areas TEXT NOT NULL DEFAULT '[]',
    last_topic TEXT,
    started_at TEXT NOT NULL,
    update_time TEXT NOT NULL,
    PRIMARY KEY (user_id, course_id)
);

CREATE TABLE IF NOT EXISTS lesson_progress (
    user_id INTEGER NOT NULL,
    course_id INTEGER NOT NULL,
    module_number INTEGER NOT NULL,
    lesson_number TEXT NOT NULL,
    status TEXT NOT NULL,
    subtopics_completed TEXT NOT NULL DEFAULT '[]',
    understanding_score INTEGER,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    update_time TEXT NOT NULL,
    PRIMARY KEY (user_id, course_id, module_number, lesson_number)
);

CREATE TABLE IF NOT EXISTS module_quiz_result (
    user_id INTEGER NOT NULL,
    course_id INTEGER NOT NULL,
    module_number INTEGER NOT NULL,
    score INTEGER NOT NULL,
    passed INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 1,
    review_topics TEXT NOT NULL DEFAULT '[]',
    taken_at TEXT NOT NULL,
    PRIMARY KEY (user_id, course_id, module_number)
);

CREATE TABLE IF NOT EXISTS scheduled_notification (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    course_id INTEGER NOT NULL,
    scheduled_time TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    sent_at TEXT,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_notification_key
    ON scheduled_notification (user_id, course_id, scheduled_time, kind);

CREATE INDEX IF NOT EXISTS idx_notification_due
    ON scheduled_notification (status, scheduled_time);
"#;

/// Open (creating if missing) the database file and ensure the schema exists.
pub async fn open_database(path: impl AsRef<Path>) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Idempotent, safe to run on every startup.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// A pooled `:memory:` database opens a fresh empty database per connection,
/// so the test pool is pinned to a single connection that never retires.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_schema(&pool).await.unwrap();
    pool
}
