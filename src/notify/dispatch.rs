use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info};

use super::store::NotificationStore;
use super::types::{NotificationKind, ScheduledNotification};
use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::learner::UserDirectory;

#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub subject: String,
    pub body_html: String,
}

/// Turns a due notification into subject and body. Rendering happens at
/// dispatch time so a course retitled between staging and sending goes out
/// with the current title.
pub trait MessageTemplates: Send + Sync {
    fn render(
        &self,
        kind: NotificationKind,
        course_title: &str,
        scheduled_time: DateTime<Utc>,
    ) -> RenderedMessage;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTemplates;

impl MessageTemplates for BuiltinTemplates {
    fn render(
        &self,
        kind: NotificationKind,
        course_title: &str,
        scheduled_time: DateTime<Utc>,
    ) -> RenderedMessage {
        let when = scheduled_time.format("%H:%M UTC");
        match kind {
            NotificationKind::Reminder => RenderedMessage {
                subject: format!("Your lesson in {course_title} is coming up"),
                body_html: format!(
                    "<p>Heads up! Your <b>{course_title}</b> session starts at {when}. \
                     Grab a coffee and get ready.</p>"
                ),
            },
            NotificationKind::LessonStart => RenderedMessage {
                subject: format!("Time for today's {course_title} lesson"),
                body_html: format!(
                    "<p>Your <b>{course_title}</b> session is starting now ({when}). \
                     Jump back in to keep your streak going.</p>"
                ),
            },
        }
    }
}

/// Transport seam for outgoing messages. The worker never knows whether a
/// message goes over SMTP, a push gateway, or a test buffer.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body_html: &str) -> Result<()>;
}

/// Default channel: logs each message instead of sending it. Stands in until
/// a real transport is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDelivery;

#[async_trait]
impl DeliveryChannel for LoggingDelivery {
    async fn send(&self, to: &str, subject: &str, _body_html: &str) -> Result<()> {
        info!("delivering to {}: {}", to, subject);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TickStats {
    pub selected: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Drains due notifications in batches. Every item is marked sent or failed
/// before the tick returns; a failed item stays failed and is never picked
/// up again, the record is the audit trail.
pub struct DispatchWorker {
    store: NotificationStore,
    catalog: Arc<Catalog>,
    directory: Arc<dyn UserDirectory>,
    channel: Arc<dyn DeliveryChannel>,
    templates: Arc<dyn MessageTemplates>,
    clock: Arc<dyn Clock>,
    batch_size: i64,
    delivery_timeout: Duration,
}

impl DispatchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: NotificationStore,
        catalog: Arc<Catalog>,
        directory: Arc<dyn UserDirectory>,
        channel: Arc<dyn DeliveryChannel>,
        templates: Arc<dyn MessageTemplates>,
        clock: Arc<dyn Clock>,
        batch_size: i64,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            directory,
            channel,
            templates,
            clock,
            batch_size,
            delivery_timeout,
        }
    }

    /// One dispatch pass. A delivery error only sinks its own item; storage
    /// errors abort the tick since nothing else would get through either.
    pub async fn tick(&self) -> Result<TickStats> {
        let now = self.clock.now_utc();
        let batch = self.store.due_batch(now, self.batch_size).await?;
        let mut stats = TickStats {
            selected: batch.len(),
            ..Default::default()
        };
        for item in batch {
            match self.deliver(&item).await {
                Ok(()) => {
                    self.store.mark_sent(item.id, self.clock.now_utc()).await?;
                    stats.sent += 1;
                }
                Err(e) => {
                    error!(
                        "notification {} ({} for {}/{}) failed: {}",
                        item.id, item.kind, item.user_id, item.course_id, e
                    );
                    self.store.mark_failed(item.id, &e.to_string()).await?;
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn deliver(&self, item: &ScheduledNotification) -> Result<()> {
        let learner = self.directory.learner_profile(item.user_id).await?;
        // clone the title so the catalog cache guard is gone before the send
        let title = self.catalog.get_course(item.course_id).await?.title.clone();
        let message = self.templates.render(item.kind, &title, item.scheduled_time);
        match tokio::time::timeout(
            self.delivery_timeout,
            self.channel
                .send(&learner.email, &message.subject, &message.body_html),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::delivery_failure(format!(
                "delivery timed out after {:?}",
                self.delivery_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone as _;

    use super::*;
    use crate::catalog::course::{Course, Lesson, Module};
    use crate::clock::ManualClock;
    use crate::learner::LearnerDirectory;
    use crate::notify::types::NotificationStatus;
    use crate::store::memory_pool;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl DeliveryChannel for RecordingChannel {
        async fn send(&self, to: &str, subject: &str, body_html: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string(), body_html.to_string()));
            Ok(())
        }
    }

    /// Fails the nth call (1-based), succeeds otherwise.
    struct FailOnNth {
        calls: AtomicUsize,
        nth: usize,
    }

    impl FailOnNth {
        fn new(nth: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                nth,
            }
        }
    }

    #[async_trait]
    impl DeliveryChannel for FailOnNth {
        async fn send(&self, _to: &str, _subject: &str, _body_html: &str) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.nth {
                Err(Error::delivery_failure("smtp connection refused"))
            } else {
                Ok(())
            }
        }
    }

    /// Never resolves, so every send runs into the worker timeout.
    struct StalledChannel;

    #[async_trait]
    impl DeliveryChannel for StalledChannel {
        async fn send(&self, _to: &str, _subject: &str, _body_html: &str) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn course(id: i64) -> Course {
        Course {
            id,
            title: "Practical Navigation".to_string(),
            description: None,
            modules: vec![Module {
                module_number: 1,
                title: "Basics".to_string(),
                lessons: vec![Lesson {
                    lesson_number: "1.1".to_string(),
                    title: "Intro".to_string(),
                    subtopics: vec![],
                }],
            }],
        }
    }

    struct Fixture {
        worker: DispatchWorker,
        store: NotificationStore,
        clock: Arc<ManualClock>,
        user_id: i64,
    }

    /// Clock at 2026-01-15 12:00 UTC, course 7, one learner.
    async fn fixture(channel: Arc<dyn DeliveryChannel>, batch_size: i64) -> Fixture {
        let pool = memory_pool().await;
        let catalog = Arc::new(Catalog::new(pool.clone()).await.unwrap());
        catalog.upsert_course(&course(7)).await.unwrap();
        let directory = Arc::new(LearnerDirectory::new(pool.clone()));
        let user_id = directory
            .create_learner("Ada", "ada@example.com", "UTC")
            .await
            .unwrap();
        let store = NotificationStore::new(pool);
        let clock = Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap(),
        ));
        let worker = DispatchWorker::new(
            store.clone(),
            catalog,
            directory,
            channel,
            Arc::new(BuiltinTemplates),
            clock.clone(),
            batch_size,
            Duration::from_millis(50),
        );
        Fixture {
            worker,
            store,
            clock,
            user_id,
        }
    }

    async fn stage_due(fx: &Fixture, minute: u32, kind: NotificationKind) -> i64 {
        fx.store
            .insert_pending(
                fx.user_id,
                7,
                Utc.with_ymd_and_hms(2026, 1, 15, 11, minute, 0).unwrap(),
                kind,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn delivers_due_items_and_marks_them_sent() {
        let channel = Arc::new(RecordingChannel::default());
        let fx = fixture(channel.clone(), 100).await;
        stage_due(&fx, 0, NotificationKind::Reminder).await;
        stage_due(&fx, 30, NotificationKind::LessonStart).await;

        let stats = fx.worker.tick().await.unwrap();
        assert_eq!(stats.selected, 2);
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.failed, 0);

        {
            let sent = channel.sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[0].0, "ada@example.com");
            assert!(sent[0].1.contains("Practical Navigation"));
            assert!(sent[1].1.contains("Time for today's"));
        }

        for record in fx.store.for_enrollment(fx.user_id, 7).await.unwrap() {
            assert_eq!(record.status, NotificationStatus::Sent);
            assert_eq!(record.sent_at, Some(fx.clock.now_utc()));
        }
    }

    #[tokio::test]
    async fn one_failure_does_not_sink_the_batch() {
        let fx = fixture(Arc::new(FailOnNth::new(2)), 100).await;
        stage_due(&fx, 0, NotificationKind::Reminder).await;
        let failing = stage_due(&fx, 10, NotificationKind::LessonStart).await;
        stage_due(&fx, 20, NotificationKind::Reminder).await;

        let stats = fx.worker.tick().await.unwrap();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.failed, 1);

        let records = fx.store.for_enrollment(fx.user_id, 7).await.unwrap();
        let failed = records.iter().find(|r| r.id == failing).unwrap();
        assert_eq!(failed.status, NotificationStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert!(
            failed
                .error_message
                .as_deref()
                .unwrap()
                .contains("smtp connection refused")
        );
        assert!(
            records
                .iter()
                .filter(|r| r.id != failing)
                .all(|r| r.status == NotificationStatus::Sent)
        );
    }

    #[tokio::test]
    async fn failed_items_are_never_retried() {
        let fx = fixture(Arc::new(FailOnNth::new(1)), 100).await;
        stage_due(&fx, 0, NotificationKind::Reminder).await;

        assert_eq!(fx.worker.tick().await.unwrap().failed, 1);
        // later ticks leave the failed record alone even as time moves on
        fx.clock.advance(chrono::Duration::hours(1));
        let stats = fx.worker.tick().await.unwrap();
        assert_eq!(stats.selected, 0);

        let records = fx.store.for_enrollment(fx.user_id, 7).await.unwrap();
        assert_eq!(records[0].status, NotificationStatus::Failed);
        assert_eq!(records[0].retry_count, 1);
    }

    #[tokio::test]
    async fn future_items_wait_their_turn() {
        let channel = Arc::new(RecordingChannel::default());
        let fx = fixture(channel.clone(), 100).await;
        fx.store
            .insert_pending(
                fx.user_id,
                7,
                Utc.with_ymd_and_hms(2026, 1, 15, 18, 0, 0).unwrap(),
                NotificationKind::LessonStart,
            )
            .await
            .unwrap();

        assert_eq!(fx.worker.tick().await.unwrap().selected, 0);
        assert!(channel.sent.lock().unwrap().is_empty());

        fx.clock.set(Utc.with_ymd_and_hms(2026, 1, 15, 18, 0, 0).unwrap());
        assert_eq!(fx.worker.tick().await.unwrap().sent, 1);
    }

    #[tokio::test]
    async fn batch_size_caps_each_tick() {
        let fx = fixture(Arc::new(RecordingChannel::default()), 2).await;
        stage_due(&fx, 0, NotificationKind::Reminder).await;
        stage_due(&fx, 10, NotificationKind::Reminder).await;
        stage_due(&fx, 20, NotificationKind::Reminder).await;

        assert_eq!(fx.worker.tick().await.unwrap().selected, 2);
        assert_eq!(fx.worker.tick().await.unwrap().selected, 1);
        assert_eq!(fx.worker.tick().await.unwrap().selected, 0);
    }

    #[tokio::test]
    async fn stalled_delivery_times_out_and_fails_the_item() {
        let fx = fixture(Arc::new(StalledChannel), 100).await;
        let id = stage_due(&fx, 0, NotificationKind::Reminder).await;

        let stats = fx.worker.tick().await.unwrap();
        assert_eq!(stats.failed, 1);

        let records = fx.store.for_enrollment(fx.user_id, 7).await.unwrap();
        let record = records.iter().find(|r| r.id == id).unwrap();
        assert_eq!(record.status, NotificationStatus::Failed);
        assert!(record.error_message.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn unknown_learner_fails_only_that_item() {
        let fx = fixture(Arc::new(RecordingChannel::default()), 100).await;
        stage_due(&fx, 0, NotificationKind::Reminder).await;
        fx.store
            .insert_pending(
                404,
                7,
                Utc.with_ymd_and_hms(2026, 1, 15, 11, 5, 0).unwrap(),
                NotificationKind::Reminder,
            )
            .await
            .unwrap();

        let stats = fx.worker.tick().await.unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.failed, 1);
        let orphaned = fx.store.for_enrollment(404, 7).await.unwrap();
        assert!(
            orphaned[0]
                .error_message
                .as_deref()
                .unwrap()
                .contains("learner 404 not found")
        );
    }

    mod template_tests {
        use super::*;

        #[test]
        fn builtin_templates_differ_by_kind() {
            let at = Utc.with_ymd_and_hms(2026, 1, 15, 14, 0, 0).unwrap();
            let reminder = BuiltinTemplates.render(NotificationKind::Reminder, "Astronomy", at);
            let start = BuiltinTemplates.render(NotificationKind::LessonStart, "Astronomy", at);
            assert!(reminder.subject.contains("Astronomy"));
            assert!(reminder.body_html.contains("14:00 UTC"));
            assert!(start.subject.contains("Astronomy"));
            assert_ne!(reminder.subject, start.subject);
        }
    }
}
