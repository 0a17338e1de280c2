//! Agent command runner, the work item body used by the binary.
//!
//! Runs a configured shell command with the prompt on stdin, bounded by a
//! wall-clock timeout. A command that overruns is killed. What the command
//! does with the prompt (and where it posts results) is up to the command.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::TaskError;
use crate::producers::{DiscoveredItem, EventHandler, HeartbeatCheck};
use crate::queue::Producer;
use crate::schedule::{JobDefinition, JobExecutor};

/// Maximum output echoed into logs and error messages (4KB).
const MAX_OUTPUT_SIZE: usize = 4 * 1024;

/// External command that executes one prompt.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    command: String,
    timeout: Duration,
}

impl AgentCommand {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    /// Run the command once for `key`. Returns captured stdout.
    pub async fn run(
        &self,
        key: &str,
        prompt: &str,
        workdir: Option<&Path>,
        channel: Option<&str>,
    ) -> Result<String, TaskError> {
        let mut command = Command::new("sh");
        command
            .args(["-c", self.command.as_str()])
            .env("DISPATCH_TASK_KEY", key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }
        if let Some(channel) = channel {
            command.env("DISPATCH_CHANNEL", channel);
        }

        let mut child = command
            .spawn()
            .map_err(|e| TaskError::Spawn(format!("{}: {e}", self.command)))?;
        let stdin = child.stdin.take();
        let prompt = prompt.to_string();

        // Dropping the child on timeout kills it.
        let run = async move {
            if let Some(mut stdin) = stdin {
                // A command that ignores its prompt may exit before reading it.
                match stdin.write_all(prompt.as_bytes()).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
                drop(stdin);
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(TaskError::Failed(format!("command I/O failed: {e}"))),
            Err(_) => {
                return Err(TaskError::Timeout {
                    key: key.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = truncate(&String::from_utf8_lossy(&output.stderr), MAX_OUTPUT_SIZE);
            return Err(TaskError::Failed(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        debug!(key = %key, output = %truncate(&stdout, MAX_OUTPUT_SIZE), "Agent command output");
        Ok(stdout)
    }
}

#[async_trait]
impl JobExecutor for AgentCommand {
    async fn execute(
        &self,
        job: &JobDefinition,
        channel: &str,
        key: &str,
    ) -> Result<(), TaskError> {
        let output = self
            .run(key, &job.prompt, job.working_directory.as_deref(), Some(channel))
            .await?;
        info!(job = %job.name, key = %key, bytes = output.len(), "Cron job completed");
        Ok(())
    }
}

/// Webhook handler that keys work on the first JSON pointer present in the
/// payload and hands the payload to an agent command.
pub struct WebhookCommand {
    agent: AgentCommand,
    producer: Producer,
    key_pointers: Vec<String>,
}

impl WebhookCommand {
    pub fn new(agent: AgentCommand, producer: Producer, key_pointers: Vec<String>) -> Self {
        Self {
            agent,
            producer,
            key_pointers,
        }
    }

    /// Pointers that identify the logical unit of work for a source.
    pub fn default_key_pointers(producer: Producer) -> Vec<String> {
        let pointers: &[&str] = match producer {
            Producer::GitHub => &["/pull_request/html_url", "/issue/html_url"],
            Producer::Linear => &["/data/url", "/data/id"],
            Producer::Heartbeat | Producer::Cron => &[],
        };
        pointers.iter().map(|p| p.to_string()).collect()
    }
}

#[async_trait]
impl EventHandler for WebhookCommand {
    fn work_key(&self, payload: &serde_json::Value) -> Option<String> {
        self.key_pointers.iter().find_map(|pointer| {
            let value = payload.pointer(pointer)?;
            let id = match value {
                serde_json::Value::String(s) if !s.is_empty() => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some(format!("{}:{id}", self.producer))
        })
    }

    async fn handle(&self, payload: serde_json::Value) -> Result<(), TaskError> {
        let key = self.work_key(&payload).unwrap_or_default();
        let prompt = serde_json::to_string_pretty(&payload)
            .map_err(|e| TaskError::Failed(format!("payload encoding failed: {e}")))?;
        self.agent.run(&key, &prompt, None, None).await?;
        Ok(())
    }
}

/// Heartbeat check backed by two commands: one lists items as a JSON array
/// of objects with an `id`, the other handles one item (as JSON on stdin).
pub struct CommandCheck {
    source: String,
    discover: AgentCommand,
    agent: AgentCommand,
}

impl CommandCheck {
    pub fn new(source: impl Into<String>, discover: AgentCommand, agent: AgentCommand) -> Self {
        Self {
            source: source.into(),
            discover,
            agent,
        }
    }
}

#[async_trait]
impl HeartbeatCheck for CommandCheck {
    fn source(&self) -> &str {
        &self.source
    }

    async fn discover(&self) -> Result<Vec<DiscoveredItem>, TaskError> {
        let key = format!("{}:discover", self.source);
        let output = self.discover.run(&key, "", None, None).await?;
        parse_discovered(&output)
    }

    async fn handle(&self, item: DiscoveredItem) -> Result<(), TaskError> {
        let key = format!("{}:{}", self.source, item.id);
        let prompt = serde_json::to_string_pretty(&item.payload)
            .map_err(|e| TaskError::Failed(format!("payload encoding failed: {e}")))?;
        self.agent.run(&key, &prompt, None, None).await?;
        Ok(())
    }
}

/// Parse discovery output. Entries without a usable `id` are dropped.
fn parse_discovered(output: &str) -> Result<Vec<DiscoveredItem>, TaskError> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<serde_json::Value> = serde_json::from_str(output)
        .map_err(|e| TaskError::Failed(format!("discovery output is not a JSON array: {e}")))?;

    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            let id = match entry.get("id")? {
                serde_json::Value::String(s) if !s.is_empty() => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some(DiscoveredItem::new(id, entry))
        })
        .collect())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        // Find a safe char boundary
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
