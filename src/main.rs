use std::sync::Arc;

use agent_dispatch::api::dispatch_routes;
use agent_dispatch::config::DispatchConfig;
use agent_dispatch::dedup::{IdempotencyCache, spawn_sweep_task};
use agent_dispatch::error::ConfigError;
use agent_dispatch::producers::{HeartbeatPoller, WebhookIntake, spawn_heartbeat_loop};
use agent_dispatch::queue::{Producer, TaskQueue};
use agent_dispatch::runner::{AgentCommand, CommandCheck, WebhookCommand};
use agent_dispatch::schedule::JobScheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DispatchConfig::from_env()?;
    let agent_command = config
        .agent_command
        .clone()
        .ok_or_else(|| ConfigError::MissingRequired {
            key: "DISPATCH_AGENT_CMD".to_string(),
            hint: "export DISPATCH_AGENT_CMD='my-agent --stdin'".to_string(),
        })?;
    let agent = AgentCommand::new(agent_command, config.agent_timeout);

    eprintln!("Agent Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Max concurrent: {}", config.max_concurrent);
    eprintln!("   Jobs: {}", config.jobs_path.display());
    eprintln!(
        "   Default channel: {}",
        config.default_channel.as_deref().unwrap_or("(none)")
    );
    eprintln!("   Webhooks: http://0.0.0.0:{}/webhooks/{{github,linear}}", config.port);
    eprintln!("   Queue API: http://0.0.0.0:{}/api/queue", config.port);

    // ── Queue and dedup caches ──────────────────────────────────────────
    let queue = TaskQueue::new(config.max_concurrent);
    let deliveries = IdempotencyCache::new("webhook", config.webhook_dedup_ttl);
    let heartbeat_seen = IdempotencyCache::new("heartbeat", config.heartbeat_dedup_ttl);
    spawn_sweep_task(Arc::clone(&deliveries), config.sweep_interval);
    spawn_sweep_task(Arc::clone(&heartbeat_seen), config.sweep_interval);

    // ── Webhook intake ──────────────────────────────────────────────────
    let mut intake = WebhookIntake::new(Arc::clone(&queue), deliveries);
    for producer in [Producer::GitHub, Producer::Linear] {
        let handler = WebhookCommand::new(
            agent.clone(),
            producer,
            WebhookCommand::default_key_pointers(producer),
        );
        intake = intake.with_handler(producer, Arc::new(handler));
    }
    let intake = Arc::new(intake);

    // ── Heartbeat ───────────────────────────────────────────────────────
    if let Some(discover) = config.heartbeat_command.clone() {
        let check = CommandCheck::new(
            "heartbeat",
            AgentCommand::new(discover, config.agent_timeout),
            agent.clone(),
        );
        let poller = HeartbeatPoller::new(Arc::clone(&queue), heartbeat_seen)
            .with_check(Arc::new(check));
        spawn_heartbeat_loop(Arc::new(poller), config.heartbeat_interval);
        eprintln!(
            "   Heartbeat: enabled (every {}s)",
            config.heartbeat_interval.as_secs()
        );
    } else {
        eprintln!("   Heartbeat: disabled");
    }

    // ── Cron scheduler ──────────────────────────────────────────────────
    let scheduler = JobScheduler::new(&config, Arc::clone(&queue), Arc::new(agent));
    scheduler.start().await;

    // ── HTTP server ─────────────────────────────────────────────────────
    let app = dispatch_routes(Arc::clone(&queue), intake, Some(Arc::clone(&scheduler)));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Dispatch server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    scheduler.stop().await;
    Ok(())
}
