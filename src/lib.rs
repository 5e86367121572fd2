pub mod catalog;
pub mod clock;
pub mod config;
pub mod error;
pub mod learner;
pub mod notify;
pub mod progress;
pub mod store;
pub mod utils;
pub mod workers;
