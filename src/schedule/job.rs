//! Job definitions and the cron dialect they are written in.
//!
//! The job list is a JSON array:
//!
//! ```json
//! [
//!   {
//!     "name": "standup-digest",
//!     "schedule": "0 9 * * 1-5",
//!     "prompt": "Summarize yesterday's merged PRs",
//!     "channel": "C0123ENG",
//!     "cwd": "/srv/repos/app"
//!   }
//! ]
//! ```
//!
//! `name`, `schedule` and `prompt` are required. Schedules use the standard
//! 5-field syntax (minute, hour, day-of-month, month, day-of-week) and are
//! evaluated in UTC.

use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::ScheduleError;

/// Day-of-week names, indexed by the standard numeric value (0 = Sunday).
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// One validated entry of the job list. Never mutated after load.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub name: String,
    /// The schedule as written in the job list.
    pub schedule: String,
    pub prompt: String,
    pub channel: Option<String>,
    pub working_directory: Option<PathBuf>,
    cron: CronSchedule,
}

impl JobDefinition {
    /// Build a job, validating its cron expression.
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Result<Self, ScheduleError> {
        let schedule = schedule.into();
        let cron = to_cron_schedule(&schedule)?;
        Ok(Self {
            name: name.into(),
            schedule,
            prompt: prompt.into(),
            channel: None,
            working_directory: None,
            cron,
        })
    }

    /// Set the destination channel.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Set the working directory.
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// First fire time strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.next_after(after)
    }

    /// The job's own channel, else the fallback.
    pub fn resolve_channel(&self, fallback: Option<&str>) -> Option<String> {
        self.channel
            .clone()
            .or_else(|| fallback.map(String::from))
    }

    /// Queue key for one firing. Unique per firing, so recurring runs are
    /// never deduplicated against each other.
    pub fn work_key(&self, fire_time: DateTime<Utc>) -> String {
        format!("cron:{}:{}", self.name, fire_time.to_rfc3339())
    }
}

/// Result of parsing a job list.
#[derive(Debug, Default)]
pub struct ParsedJobs {
    pub jobs: Vec<JobDefinition>,
    /// Entries dropped with a warning.
    pub skipped: usize,
}

/// Parse a job list.
///
/// Invalid JSON fails the whole list. Valid JSON that is not an array yields
/// zero jobs. Each entry is validated on its own; a bad entry is skipped with
/// a warning and its siblings still load.
pub fn parse_job_list(path: &Path, raw: &str) -> Result<ParsedJobs, ScheduleError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ScheduleError::SourceParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let Some(entries) = value.as_array() else {
        warn!(path = %path.display(), "Job list is not an array, no jobs loaded");
        return Ok(ParsedJobs::default());
    };

    let mut parsed = ParsedJobs::default();
    let mut names = HashSet::new();

    for (index, entry) in entries.iter().enumerate() {
        match parse_entry(index, entry) {
            Ok(Some(job)) => {
                if !names.insert(job.name.clone()) {
                    warn!(job = %job.name, index, "Duplicate job name, entry skipped");
                    parsed.skipped += 1;
                    continue;
                }
                parsed.jobs.push(job);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(index, error = %e, "Invalid job entry skipped");
                parsed.skipped += 1;
            }
        }
    }

    Ok(parsed)
}

/// Parse one entry. `Ok(None)` means the entry is explicitly disabled.
fn parse_entry(
    index: usize,
    entry: &serde_json::Value,
) -> Result<Option<JobDefinition>, ScheduleError> {
    let name = required_str(index, entry, "name")?;
    let schedule = required_str(index, entry, "schedule")?;
    let prompt = required_str(index, entry, "prompt")?;

    if entry.get("enabled").and_then(|v| v.as_bool()) == Some(false) {
        info!(job = %name, "Job disabled, not scheduled");
        return Ok(None);
    }

    let mut job = JobDefinition::new(name, schedule, prompt)?;
    if let Some(channel) = optional_str(entry, &["channel", "targetChannel"]) {
        job = job.with_channel(channel);
    }
    if let Some(dir) = optional_str(entry, &["cwd", "workingDirectory"]) {
        job = job.with_working_directory(dir);
    }
    Ok(Some(job))
}

fn required_str(
    index: usize,
    entry: &serde_json::Value,
    field: &'static str,
) -> Result<String, ScheduleError> {
    entry
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or(ScheduleError::MissingField { index, field })
}

fn optional_str(entry: &serde_json::Value, fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .filter_map(|f| entry.get(*f).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(String::from)
}

/// A compiled 5-field cron expression.
///
/// The `cron` crate fires only on days matching both day fields. Standard
/// cron fires on either when both are restricted, so that case compiles to
/// one schedule per day field and the earliest match wins.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    alternatives: Vec<cron::Schedule>,
}

impl CronSchedule {
    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.alternatives
            .iter()
            .filter_map(|schedule| schedule.after(&after).next())
            .min()
    }
}

/// Translate a standard 5-field cron expression for the `cron` crate, which
/// wants a leading seconds field and named weekdays.
pub fn to_cron_schedule(expression: &str) -> Result<CronSchedule, ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason,
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    let &[minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
        return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
    };

    let day_of_week = normalize_day_of_week(day_of_week).map_err(invalid)?;
    let build = |dom: &str, dow: &str| {
        let full = format!("0 {minute} {hour} {dom} {month} {dow}");
        cron::Schedule::from_str(&full).map_err(|e| invalid(e.to_string()))
    };

    let alternatives = if is_unrestricted(day_of_month) || is_unrestricted(&day_of_week) {
        vec![build(day_of_month, &day_of_week)?]
    } else {
        vec![build(day_of_month, "*")?, build("*", &day_of_week)?]
    };
    Ok(CronSchedule { alternatives })
}

/// A day field starting with `*` (including steps like `*/2`) does not
/// restrict the day, matching classic cron.
fn is_unrestricted(field: &str) -> bool {
    field.starts_with('*') || field == "?"
}

/// Rewrite numeric weekdays (0-7, both 0 and 7 meaning Sunday) as names.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    let mut parts = Vec::new();

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (part, None),
        };

        let range = match range.split_once('-') {
            Some((start, end)) => {
                let start = weekday_name(start)?;
                // 7 closes a range on Sunday, which the cron crate numbers first.
                if end.trim() == "7" && start != "SUN" {
                    if step.is_some() {
                        return Err(format!("unsupported day-of-week range '{part}'"));
                    }
                    if start == "SAT" {
                        parts.push(start);
                    } else {
                        parts.push(format!("{start}-SAT"));
                    }
                    parts.push("SUN".to_string());
                    continue;
                }
                format!("{start}-{}", weekday_name(end)?)
            }
            None if range == "*" || range == "?" => range.to_string(),
            None => weekday_name(range)?,
        };

        match step {
            Some(step) => parts.push(format!("{range}/{step}")),
            None => parts.push(range),
        }
    }

    Ok(parts.join(","))
}

fn weekday_name(token: &str) -> Result<String, String> {
    let token = token.trim();
    if let Ok(n) = token.parse::<usize>() {
        return match n {
            0..=6 => Ok(WEEKDAYS[n].to_string()),
            7 => Ok(WEEKDAYS[0].to_string()),
            _ => Err(format!("day-of-week {n} out of range")),
        };
    }
    if !token.is_empty() && token.chars().all(|c| c.is_ascii_alphabetic()) {
        return Ok(token.to_ascii_uppercase());
    }
    Err(format!("invalid day-of-week '{token}'"))
}

/// Fingerprint of the job list contents, used to detect edits.
pub fn fingerprint(content: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}
