//! Job list loading, hot reload, and timer swap for the cron scheduler.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::timeout;

use agent_dispatch::config::DispatchConfig;
use agent_dispatch::error::{ScheduleError, TaskError};
use agent_dispatch::queue::{TaskEvent, TaskQueue};
use agent_dispatch::schedule::{JobDefinition, JobExecutor, JobScheduler};

/// Virtual-time budget for waits; paused clocks make this cheap.
const TEST_TIMEOUT: Duration = Duration::from_secs(3600);

/// Records every (job, channel, key) it is asked to run.
#[derive(Default)]
struct RecordingExecutor {
    runs: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl JobExecutor for RecordingExecutor {
    async fn execute(&self, job: &JobDefinition, channel: &str, key: &str) -> Result<(), TaskError> {
        self.runs
            .lock()
            .unwrap()
            .push((job.name.clone(), channel.to_string(), key.to_string()));
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    path: PathBuf,
    queue: Arc<TaskQueue>,
    executor: Arc<RecordingExecutor>,
    scheduler: Arc<JobScheduler>,
}

fn harness(default_channel: Option<&str>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cron-jobs.json");
    let config = DispatchConfig {
        jobs_path: path.clone(),
        default_channel: default_channel.map(String::from),
        reload_interval: Duration::from_secs(1),
        ..DispatchConfig::default()
    };
    let queue = TaskQueue::new(2);
    let executor = Arc::new(RecordingExecutor::default());
    let scheduler = JobScheduler::new(&config, Arc::clone(&queue), executor.clone());
    Harness {
        _dir: dir,
        path,
        queue,
        executor,
        scheduler,
    }
}

fn write_jobs(path: &Path, jobs: serde_json::Value) {
    std::fs::write(path, serde_json::to_vec_pretty(&jobs).unwrap()).unwrap();
}

fn job(name: &str, schedule: &str) -> serde_json::Value {
    serde_json::json!({ "name": name, "schedule": schedule, "prompt": format!("run {name}") })
}

async fn names(scheduler: &JobScheduler) -> Vec<String> {
    scheduler.jobs().await.into_iter().map(|j| j.name).collect()
}

/// Wait for the next admitted cron key, tolerating lag.
async fn next_admitted(rx: &mut broadcast::Receiver<TaskEvent>) -> String {
    timeout(TEST_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(TaskEvent::Admitted { key, .. }) => return key,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("queue event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for a firing")
}

/// Keys admitted so far that are already buffered.
fn drain_admitted(rx: &mut broadcast::Receiver<TaskEvent>) -> Vec<String> {
    let mut keys = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(TaskEvent::Admitted { key, .. }) => keys.push(key),
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return keys,
        }
    }
}

#[tokio::test]
async fn bad_entries_do_not_block_siblings() {
    let h = harness(None);
    write_jobs(
        &h.path,
        serde_json::json!([
            job("digest", "0 9 * * 1-5"),
            { "name": "no-prompt", "schedule": "0 9 * * *" },
            job("bad-cron", "every monday"),
            { "name": "triage", "schedule": "*/15 * * * *", "prompt": "triage inbox",
              "targetChannel": "C042", "workingDirectory": "/srv/app" },
            job("digest", "0 10 * * *"),
        ]),
    );

    assert_eq!(h.scheduler.reload().await.unwrap(), 2);
    assert_eq!(names(&h.scheduler).await, vec!["digest", "triage"]);

    let jobs = h.scheduler.jobs().await;
    let triage = jobs.iter().find(|j| j.name == "triage").unwrap();
    assert_eq!(triage.channel.as_deref(), Some("C042"));
    assert_eq!(triage.working_directory.as_deref(), Some("/srv/app"));
    assert!(triage.next_fire_at.is_some());
    h.scheduler.stop().await;
}

#[tokio::test]
async fn parse_failure_keeps_current_jobs() {
    let h = harness(None);
    write_jobs(&h.path, serde_json::json!([job("digest", "0 9 * * *")]));
    assert_eq!(h.scheduler.reload().await.unwrap(), 1);

    std::fs::write(&h.path, "[{ not json").unwrap();
    let err = h.scheduler.reload().await.unwrap_err();
    assert!(matches!(err, ScheduleError::SourceParse { .. }));
    assert_eq!(names(&h.scheduler).await, vec!["digest"]);

    // Valid JSON of the wrong shape is an empty list, not an error.
    write_jobs(&h.path, serde_json::json!({ "jobs": [] }));
    assert_eq!(h.scheduler.reload().await.unwrap(), 0);
    assert!(h.scheduler.jobs().await.is_empty());
    h.scheduler.stop().await;
}

#[tokio::test]
async fn deleted_file_empties_schedule() {
    let h = harness(None);
    write_jobs(&h.path, serde_json::json!([job("digest", "0 9 * * *")]));
    assert_eq!(h.scheduler.reload().await.unwrap(), 1);

    std::fs::remove_file(&h.path).unwrap();
    assert_eq!(h.scheduler.reload().await.unwrap(), 0);
    assert!(h.scheduler.jobs().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reload_swaps_timers() {
    let h = harness(Some("ops"));
    let mut events = h.queue.subscribe();

    write_jobs(&h.path, serde_json::json!([job("X", "* * * * *")]));
    assert_eq!(h.scheduler.reload().await.unwrap(), 1);

    let mut x_keys = HashSet::new();
    while x_keys.len() < 3 {
        let key = next_admitted(&mut events).await;
        assert!(key.starts_with("cron:X:"), "unexpected key {key}");
        assert!(x_keys.insert(key), "fire time repeated");
    }

    write_jobs(&h.path, serde_json::json!([job("Y", "* * * * *")]));
    assert_eq!(h.scheduler.reload().await.unwrap(), 1);
    assert_eq!(names(&h.scheduler).await, vec!["Y"]);

    // Firings that raced the swap are already buffered.
    for key in drain_admitted(&mut events) {
        assert!(key.starts_with("cron:X:"), "Y fired before reload returned: {key}");
    }

    let mut y_keys = HashSet::new();
    while y_keys.len() < 3 {
        let key = next_admitted(&mut events).await;
        assert!(key.starts_with("cron:Y:"), "old timer still firing: {key}");
        assert!(y_keys.insert(key));
    }

    h.scheduler.stop().await;
    let runs = h.executor.runs.lock().unwrap().clone();
    assert!(runs.iter().all(|(_, channel, _)| channel == "ops"));
}

#[tokio::test(start_paused = true)]
async fn surviving_job_does_not_double_fire() {
    let h = harness(Some("ops"));
    let mut events = h.queue.subscribe();

    write_jobs(&h.path, serde_json::json!([job("X", "* * * * *")]));
    h.scheduler.reload().await.unwrap();

    let mut keys = HashSet::new();
    keys.insert(next_admitted(&mut events).await);

    // Same job, reordered file: a reload must not replay a fire time.
    write_jobs(
        &h.path,
        serde_json::json!([job("Z", "0 0 1 1 *"), job("X", "* * * * *")]),
    );
    h.scheduler.reload().await.unwrap();

    while keys.len() < 4 {
        let key = next_admitted(&mut events).await;
        assert!(keys.insert(key.clone()), "fire time repeated across reload: {key}");
    }
    h.scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn watcher_picks_up_changes() {
    let h = harness(Some("ops"));
    h.scheduler.start().await;
    assert!(h.scheduler.jobs().await.is_empty());

    write_jobs(&h.path, serde_json::json!([job("nightly", "0 3 * * *")]));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(names(&h.scheduler).await, vec!["nightly"]);

    write_jobs(
        &h.path,
        serde_json::json!([job("nightly", "0 3 * * *"), job("weekly", "0 6 * * 0")]),
    );
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(names(&h.scheduler).await, vec!["nightly", "weekly"]);

    h.scheduler.stop().await;
}

#[tokio::test]
async fn unchanged_source_is_not_reloaded() {
    let h = harness(None);
    write_jobs(&h.path, serde_json::json!([job("digest", "0 9 * * *")]));
    h.scheduler.start().await;

    assert!(!h.scheduler.check_source().await);
    write_jobs(&h.path, serde_json::json!([job("digest", "0 10 * * *")]));
    assert!(h.scheduler.check_source().await);
    assert!(!h.scheduler.check_source().await);
    h.scheduler.stop().await;
}

#[tokio::test]
async fn firing_due_during_reload_still_happens() {
    use chrono::{Timelike, Utc};

    let h = harness(Some("ops"));
    let job_def = JobDefinition::new("X", "* * * * *", "run X").unwrap();

    // X last fired two minutes ago; the following minute is already due.
    let last = (Utc::now() - chrono::Duration::minutes(2))
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap();
    assert!(h.scheduler.fire(&job_def, last));

    let mut events = h.queue.subscribe();
    write_jobs(&h.path, serde_json::json!([job("X", "* * * * *")]));
    h.scheduler.reload().await.unwrap();

    let key = timeout(Duration::from_secs(5), next_admitted(&mut events))
        .await
        .expect("overdue firing was dropped");
    assert_eq!(key, job_def.work_key(last + chrono::Duration::minutes(1)));

    // The firing already recorded is not replayed.
    assert!(!h.scheduler.fire(&job_def, last));
    h.scheduler.stop().await;
}
