use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::NaiveDate;
use clap::Parser;
use course_server::{
    catalog::{Catalog, CourseSchedule},
    clock::{Clock, SystemClock},
    config::Config,
    learner::{LearnerDirectory, UserDirectory},
    notify::{
        BuiltinTemplates, DispatchWorker, LoggingDelivery, NotificationStore, RetentionSweeper,
        ScheduleGenerator,
    },
    progress::{ProgressStore, ProgressionEngine},
    store::open_database,
    utils::init_log,
    workers,
};
use tracing::info;

#[derive(Debug, clap::Parser)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long, default_value = "database/course.db")]
    database: PathBuf,
    /// Directory for rotated log files; stdout when absent.
    #[arg(short, long)]
    log: Option<PathBuf>,
    /// TOML config file; built-in defaults when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run the scheduling workers until interrupted.
    Serve {
        /// Course definition directory imported on startup.
        #[arg(long)]
        courses: Option<PathBuf>,
    },
    Course {
        #[command(subcommand)]
        command: CourseCommand,
    },
    Learner {
        #[command(subcommand)]
        command: LearnerCommand,
    },
    /// Enroll a learner into a course with a daily study slot.
    Enroll {
        user_id: i64,
        course_id: i64,
        /// Local wall-clock slot "HH:MM"; no slot means no notifications.
        #[arg(short, long)]
        slot: Option<String>,
        /// IANA zone for the slot; the learner's profile zone when absent.
        #[arg(short, long)]
        timezone: Option<String>,
        /// First day notifications may fire; today when absent.
        #[arg(long)]
        start_date: Option<NaiveDate>,
        #[arg(long)]
        no_notifications: bool,
    },
    /// Print the progress summary of one enrollment.
    Progress { user_id: i64, course_id: i64 },
    /// Print the scheduled notifications of one enrollment.
    Notifications { user_id: i64, course_id: i64 },
}

#[derive(Debug, clap::Subcommand)]
enum CourseCommand {
    List,
    Import { file: PathBuf },
    ImportDir { dir: PathBuf },
}

#[derive(Debug, clap::Subcommand)]
enum LearnerCommand {
    List,
    Create {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
        #[arg(short, long, default_value = "UTC")]
        timezone: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let _guard = init_log(args.log.clone());
    if let Err(e) = run(args).await {
        eprintln!("{:?}", e);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::load(args.config.as_deref())?;
    if let Some(parent) = args.database.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let database = open_database(&args.database).await?;
    let catalog = Arc::new(Catalog::new(database.clone()).await?);
    let directory = Arc::new(LearnerDirectory::new(database.clone()));
    let notifications = NotificationStore::new(database.clone());
    let clock = Arc::new(SystemClock);

    match args.command {
        Commands::Serve { courses } => {
            if let Some(dir) = courses {
                let imported = catalog.import_course_dir(dir).await?;
                info!("imported {} course definitions", imported);
            }
            let generator = ScheduleGenerator::new(
                catalog.clone(),
                directory.clone(),
                notifications.clone(),
                clock.clone(),
                config.lookahead_days,
            );
            let dispatcher = DispatchWorker::new(
                notifications.clone(),
                catalog.clone(),
                directory.clone(),
                Arc::new(LoggingDelivery),
                Arc::new(BuiltinTemplates),
                clock.clone(),
                config.dispatch_batch_size,
                Duration::from_secs(config.delivery_timeout_secs),
            );
            let sweeper = RetentionSweeper::new(
                notifications.clone(),
                clock.clone(),
                config.retention_days,
            );
            let handles = [
                workers::spawn_generation(generator),
                workers::spawn_dispatch(dispatcher, config.dispatch_tick_secs),
                workers::spawn_retention(sweeper),
            ];
            info!("course server running, ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            for handle in handles {
                handle.abort();
            }
        }
        Commands::Course { command } => match command {
            CourseCommand::List => {
                for course in catalog.course_list().await? {
                    println!(
                        "{:<20} {:<40} {} modules, {} lessons",
                        course.id,
                        course.title,
                        course.module_count(),
                        course.lesson_count()
                    );
                }
            }
            CourseCommand::Import { file } => {
                let id = catalog.import_course_file(&file).await?;
                println!("Course imported with id: {}", id);
            }
            CourseCommand::ImportDir { dir } => {
                let imported = catalog.import_course_dir(&dir).await?;
                println!("Imported {} course definitions", imported);
            }
        },
        Commands::Learner { command } => match command {
            LearnerCommand::List => {
                for learner in directory.learner_list().await? {
                    println!(
                        "{:<8} {:<24} {:<32} {:<24} streak {}",
                        learner.id, learner.name, learner.email, learner.timezone, learner.current_streak
                    );
                }
            }
            LearnerCommand::Create { name, email, timezone } => {
                timezone
                    .parse::<chrono_tz::Tz>()
                    .map_err(|e| anyhow::anyhow!("invalid timezone {timezone:?}: {e}"))?;
                let id = directory.create_learner(&name, &email, &timezone).await?;
                println!("Learner created with id: {}", id);
            }
        },
        Commands::Enroll {
            user_id,
            course_id,
            slot,
            timezone,
            start_date,
            no_notifications,
        } => {
            let profile = directory.learner_profile(user_id).await?;
            catalog.get_course(course_id).await?;
            let schedule = CourseSchedule {
                user_id,
                course_id,
                daily_slot_time: slot,
                timezone,
                start_date: start_date.unwrap_or_else(|| clock.now_utc().date_naive()),
                target_completion: None,
                notifications_enabled: !no_notifications,
            };
            // reject a malformed slot or zone before they land in the store
            schedule.slot()?;
            schedule.zone(&profile.timezone)?;
            catalog.upsert_enrollment(&schedule).await?;
            let generator = ScheduleGenerator::new(
                catalog.clone(),
                directory.clone(),
                notifications.clone(),
                clock.clone(),
                config.lookahead_days,
            );
            let staged = generator.generate_for_schedule(&schedule).await?;
            println!("Enrollment saved, {} notifications staged", staged);
        }
        Commands::Progress { user_id, course_id } => {
            let engine = ProgressionEngine::new(
                catalog.clone(),
                ProgressStore::new(database.clone()),
                directory.clone(),
                clock.clone(),
            );
            println!("{:#?}", engine.progress_summary(user_id, course_id).await?);
        }
        Commands::Notifications { user_id, course_id } => {
            for item in notifications.for_enrollment(user_id, course_id).await? {
                println!(
                    "{:<6} {:<14} {:<8} {}",
                    item.id, item.kind, item.status, item.scheduled_time
                );
            }
        }
    }
    Ok(())
}
