// LiveUpdate Engine - Core module structure
pub mod config;
pub mod error;
pub mod keystore;
pub mod metrics;
pub mod scheduler;
pub mod updater;

pub use config::LiveUpdateConfig;
pub use error::{ErrorInfo, ErrorKind, Result, UpdateError};
pub use scheduler::BackgroundScheduler;
pub use updater::LiveUpdateEngine;
