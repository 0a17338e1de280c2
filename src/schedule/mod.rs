//! Cron-driven producer.
//!
//! - `job`: job definitions, list parsing, 5-field cron translation
//! - `scheduler`: timers, firing, hot reload of the job list

pub mod job;
pub mod scheduler;

pub use job::{CronSchedule, JobDefinition, ParsedJobs, parse_job_list, to_cron_schedule};
pub use scheduler::{JobExecutor, JobScheduler, JobSnapshot};
