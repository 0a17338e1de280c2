//! Error types for the dispatch core.
//!
//! Nothing here is allowed to take the process down. Duplicate admission is
//! not an error at all (`TaskQueue::enqueue` returns `false`), and a missing
//! job list is an empty job set rather than a failure.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Job list and cron errors.
///
/// `SourceRead` and `SourceParse` reject the whole source (the scheduler keeps
/// its last-known-good jobs). `MissingField` and `InvalidCron` reject a single
/// entry; its siblings still load.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Failed to read job list {}: {source}", path.display())]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse job list {}: {reason}", path.display())]
    SourceParse { path: PathBuf, reason: String },

    #[error("Job entry {index} is missing required field '{field}'")]
    MissingField { index: usize, field: &'static str },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
}

/// Failure of a work item body. Logged by the queue, never returned to the
/// producer that admitted the item.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task {key} timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    #[error("Failed to spawn command: {0}")]
    Spawn(String),
}
