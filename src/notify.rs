pub mod dispatch;
pub mod generator;
pub mod retention;
pub mod store;
pub mod types;

pub use dispatch::{BuiltinTemplates, DeliveryChannel, DispatchWorker, LoggingDelivery, MessageTemplates};
pub use generator::ScheduleGenerator;
pub use retention::RetentionSweeper;
pub use store::NotificationStore;
pub use types::{NotificationKind, NotificationStatus, ScheduledNotification};
