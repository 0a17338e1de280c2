//! Cron job scheduler.
//!
//! Loads the job list, keeps one timer task per job, and turns each firing
//! into a fresh work item on the shared task queue. A watcher polls the job
//! list and reloads on change. Reload is a full replace: every old timer is
//! stopped and joined before any new timer starts, and a job's last fire time
//! survives the swap so a job present in both lists cannot fire twice for the
//! same instant.
//!
//! Load failures never take the scheduler down. A missing file means no jobs;
//! an unreadable or unparseable file leaves the current timers running.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::{JobDefinition, ParsedJobs, fingerprint, parse_job_list};
use crate::config::DispatchConfig;
use crate::error::{ScheduleError, TaskError};
use crate::queue::{Producer, TaskQueue, WorkItem};

/// Executes the body of a cron firing.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run `job` for one firing, reporting to `channel`.
    async fn execute(&self, job: &JobDefinition, channel: &str, key: &str)
    -> Result<(), TaskError>;
}

/// Scheduler view of one active job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub name: String,
    pub schedule: String,
    pub channel: Option<String>,
    pub working_directory: Option<String>,
    pub next_fire_at: Option<DateTime<Utc>>,
}

/// Everything a timer needs to turn a firing into a work item.
struct FireContext {
    queue: Arc<TaskQueue>,
    executor: Arc<dyn JobExecutor>,
    default_channel: Option<String>,
    /// Last fire time per job name (or when its first timer was armed),
    /// kept across reloads.
    last_fired: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl FireContext {
    fn fire(&self, job: &JobDefinition, fire_time: DateTime<Utc>) -> bool {
        {
            let mut last_fired = self.last_fired();
            if let Some(previous) = last_fired.get(&job.name)
                && *previous >= fire_time
            {
                debug!(job = %job.name, fire_time = %fire_time, "Already fired for this time, skipped");
                return false;
            }
            last_fired.insert(job.name.clone(), fire_time);
        }

        let Some(channel) = job.resolve_channel(self.default_channel.as_deref()) else {
            warn!(job = %job.name, "No channel for job and no default channel, firing dropped");
            return false;
        };

        let key = job.work_key(fire_time);
        let executor = Arc::clone(&self.executor);
        let body_job = job.clone();
        let body_key = key.clone();
        let item = WorkItem::new(key.clone(), Producer::Cron, async move {
            executor.execute(&body_job, &channel, &body_key).await
        });

        let admitted = self.queue.enqueue(item);
        if admitted {
            info!(job = %job.name, key = %key, "Cron job fired");
        } else {
            debug!(job = %job.name, key = %key, "Cron firing already queued");
        }
        admitted
    }

    fn last_fired(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.last_fired.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct ActiveJobs {
    jobs: Vec<JobDefinition>,
    timers: Vec<JoinHandle<()>>,
}

/// Declarative cron scheduler with hot reload.
pub struct JobScheduler {
    jobs_path: PathBuf,
    reload_interval: Duration,
    ctx: Arc<FireContext>,
    active: tokio::sync::Mutex<ActiveJobs>,
    /// Fingerprint of the job list as last seen by the watcher.
    seen_source: Mutex<Option<u64>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(
        config: &DispatchConfig,
        queue: Arc<TaskQueue>,
        executor: Arc<dyn JobExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs_path: config.jobs_path.clone(),
            reload_interval: config.reload_interval,
            ctx: Arc::new(FireContext {
                queue,
                executor,
                default_channel: config.default_channel.clone(),
                last_fired: Mutex::new(HashMap::new()),
            }),
            active: tokio::sync::Mutex::new(ActiveJobs::default()),
            seen_source: Mutex::new(None),
            watcher: Mutex::new(None),
        })
    }

    /// Read and validate the job list. A missing file is zero jobs.
    pub fn load(&self) -> Result<ParsedJobs, ScheduleError> {
        let raw = match std::fs::read_to_string(&self.jobs_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.jobs_path.display(), "No job list found, scheduler idle");
                return Ok(ParsedJobs::default());
            }
            Err(source) => {
                return Err(ScheduleError::SourceRead {
                    path: self.jobs_path.clone(),
                    source,
                });
            }
        };
        parse_job_list(&self.jobs_path, &raw)
    }

    /// Initial load, timers, and the job list watcher.
    pub async fn start(self: &Arc<Self>) {
        *self.seen_source() = self.source_fingerprint();
        if let Err(e) = self.reload().await {
            error!(error = %e, "Initial job list load failed, starting with no jobs");
        }

        let handle = self.spawn_watcher();
        if let Some(previous) = self.watcher().replace(handle) {
            previous.abort();
        }
        info!(
            path = %self.jobs_path.display(),
            interval_secs = self.reload_interval.as_secs(),
            "Job scheduler started"
        );
    }

    /// Replace the active job set. Returns the number of jobs now scheduled.
    ///
    /// On a load failure the current jobs keep running and the error is
    /// returned after being logged.
    pub async fn reload(&self) -> Result<usize, ScheduleError> {
        let parsed = match self.load() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Job list load failed, keeping current jobs");
                return Err(e);
            }
        };

        let mut active = self.active.lock().await;

        for timer in active.timers.drain(..) {
            timer.abort();
            // A timer caught mid-fire finishes that firing before it stops.
            let _ = timer.await;
        }

        self.ctx
            .last_fired()
            .retain(|name, _| parsed.jobs.iter().any(|j| &j.name == name));

        active.timers = parsed
            .jobs
            .iter()
            .map(|job| spawn_timer(Arc::clone(&self.ctx), job.clone()))
            .collect();
        active.jobs = parsed.jobs;

        info!(
            jobs = active.jobs.len(),
            skipped = parsed.skipped,
            "Job list loaded"
        );
        Ok(active.jobs.len())
    }

    /// Offer one firing of `job` to the queue. Returns whether it was admitted.
    pub fn fire(&self, job: &JobDefinition, fire_time: DateTime<Utc>) -> bool {
        self.ctx.fire(job, fire_time)
    }

    /// Active jobs with their next fire time.
    pub async fn jobs(&self) -> Vec<JobSnapshot> {
        let now = Utc::now();
        let active = self.active.lock().await;
        active
            .jobs
            .iter()
            .map(|job| JobSnapshot {
                name: job.name.clone(),
                schedule: job.schedule.clone(),
                channel: job.channel.clone(),
                working_directory: job
                    .working_directory
                    .as_ref()
                    .map(|p| p.display().to_string()),
                next_fire_at: job.next_fire_after(now),
            })
            .collect()
    }

    /// Stop the watcher and every timer.
    pub async fn stop(&self) {
        if let Some(watcher) = self.watcher().take() {
            watcher.abort();
        }
        let mut active = self.active.lock().await;
        for timer in active.timers.drain(..) {
            timer.abort();
        }
        info!("Job scheduler stopped");
    }

    /// Reload if the job list changed since the watcher last looked.
    /// Returns whether a reload was attempted.
    pub async fn check_source(&self) -> bool {
        let current = self.source_fingerprint();
        {
            let mut seen = self.seen_source();
            if *seen == current {
                return false;
            }
            *seen = current;
        }

        info!(path = %self.jobs_path.display(), "Job list changed, reloading");
        // Failures are logged by reload; the watcher keeps polling.
        let _ = self.reload().await;
        true
    }

    fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler: Weak<Self> = Arc::downgrade(self);
        let period = self.reload_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // Skip immediate first tick
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(scheduler) = scheduler.upgrade() else {
                    return;
                };
                scheduler.check_source().await;
            }
        })
    }

    fn source_fingerprint(&self) -> Option<u64> {
        std::fs::read(&self.jobs_path)
            .ok()
            .map(|bytes| fingerprint(&bytes))
    }

    fn seen_source(&self) -> MutexGuard<'_, Option<u64>> {
        self.seen_source.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn watcher(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.watcher.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One timer per job: sleep until the next matching minute, fire, repeat.
///
/// A timer resumes from the job's last fire time, so a firing that fell due
/// while a previous timer was being replaced still happens (once).
fn spawn_timer(ctx: Arc<FireContext>, job: JobDefinition) -> JoinHandle<()> {
    let mut after = *ctx
        .last_fired()
        .entry(job.name.clone())
        .or_insert_with(Utc::now);

    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let Some(next) = job.next_fire_after(after) else {
                info!(job = %job.name, "No upcoming fire time, timer stopped");
                return;
            };

            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(job = %job.name, next = %next, "Timer armed");
            tokio::time::sleep(wait).await;

            ctx.fire(&job, next);
            // At most one overdue firing; older missed times are skipped.
            after = next.max(now);
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    struct NoopExecutor;

    #[async_trait]
    impl JobExecutor for NoopExecutor {
        async fn execute(
            &self,
            _job: &JobDefinition,
            _channel: &str,
            _key: &str,
        ) -> Result<(), TaskError> {
            Ok(())
        }
    }

    fn scheduler(default_channel: Option<&str>) -> (Arc<JobScheduler>, Arc<TaskQueue>) {
        let config = DispatchConfig {
            jobs_path: PathBuf::from("/nonexistent/cron-jobs.json"),
            default_channel: default_channel.map(String::from),
            ..DispatchConfig::default()
        };
        let queue = TaskQueue::new(2);
        let scheduler = JobScheduler::new(&config, Arc::clone(&queue), Arc::new(NoopExecutor));
        (scheduler, queue)
    }

    fn fire_time(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn missing_source_is_idle() {
        let (scheduler, _queue) = scheduler(None);
        let parsed = scheduler.load().unwrap();
        assert!(parsed.jobs.is_empty());
        assert_eq!(scheduler.reload().await.unwrap(), 0);
        assert!(scheduler.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn fire_without_channel_is_dropped() {
        let (scheduler, queue) = scheduler(None);
        let job = JobDefinition::new("digest", "0 9 * * *", "summarize").unwrap();
        assert!(!scheduler.fire(&job, fire_time(0)));
        assert_eq!(queue.status().pending_count + queue.status().active_count, 0);
    }

    #[tokio::test]
    async fn fire_uses_default_channel() {
        let (scheduler, queue) = scheduler(Some("ops"));
        let mut events = queue.subscribe();
        let job = JobDefinition::new("digest", "0 9 * * *", "summarize").unwrap();

        assert!(scheduler.fire(&job, fire_time(0)));
        match events.recv().await.unwrap() {
            crate::queue::TaskEvent::Admitted { key, producer } => {
                assert_eq!(key, job.work_key(fire_time(0)));
                assert_eq!(producer, Producer::Cron);
            }
            other => panic!("expected Admitted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_fire_time_is_not_fired_twice() {
        let (scheduler, _queue) = scheduler(Some("ops"));
        let job = JobDefinition::new("digest", "* * * * *", "summarize").unwrap();

        assert!(scheduler.fire(&job, fire_time(1)));
        assert!(!scheduler.fire(&job, fire_time(1)));
        assert!(!scheduler.fire(&job, fire_time(0)));
        assert!(scheduler.fire(&job, fire_time(2)));
    }
}
