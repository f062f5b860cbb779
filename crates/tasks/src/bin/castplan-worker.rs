use std::time::Duration;

use anyhow::{Context, Result};
use castplan_tasks::telemetry::{init_telemetry, TelemetryConfig};
use castplan_tasks::{
    EngineConfig, ScheduleOptions, TaskContext, TaskEngine, TaskError, TaskEventKind, TaskPriority,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct SleepPayload {
    millis: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - OTEL_SERVICE_NAME / OTEL_EXPORTER_OTLP_ENDPOINT
    // - RUST_LOG or LOG_LEVEL (default: "castplan_tasks=info,castplan_worker=info")
    // - TASKS_* engine options, TASKS_DEMO_SEED to enqueue demo tasks
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "castplan-tasks" {
        telemetry_config.service_name = "castplan-worker".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("castplan_tasks=info,castplan_worker=info".to_string());
    }
    let _telemetry_guard = init_telemetry(telemetry_config);

    let config = EngineConfig::from_env();
    let engine = TaskEngine::in_memory(config).context("Invalid engine configuration")?;

    engine.register_handler("echo", |ctx: TaskContext| async move {
        Ok(ctx.payload().clone())
    });
    engine.register_handler("sleep", |ctx: TaskContext| async move {
        let payload: SleepPayload = ctx.payload_as()?;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(payload.millis)) => {
                Ok(json!({ "slept_ms": payload.millis }))
            }
            _ = ctx.cancelled() => Err(TaskError::non_retryable("cancelled")),
        }
    });

    let mut events = engine.subscribe();
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event.kind {
                TaskEventKind::StatsSnapshot { stats } => tracing::info!(
                    total = stats.total,
                    pending = stats.pending,
                    running = stats.running,
                    completed = stats.completed,
                    failed = stats.failed,
                    active_workers = stats.active_workers,
                    throughput_per_minute = stats.throughput_per_minute,
                    error_rate = stats.error_rate,
                    "Stats"
                ),
                kind => tracing::info!(
                    seq = event.seq,
                    event = kind.name(),
                    task_id = ?kind.task_id(),
                    "Event"
                ),
            }
        }
    });

    engine.start().await.context("Failed to start worker pool")?;
    tracing::info!(
        concurrency = engine.config().concurrency,
        worker_prefix = %engine.config().worker_id_prefix,
        "castplan-worker running"
    );

    let seed: usize = std::env::var("TASKS_DEMO_SEED")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if seed > 0 {
        seed_demo_tasks(&engine, seed).await?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    if let Err(e) = engine.stop().await {
        tracing::warn!(error = %e, "Shutdown did not complete cleanly");
    }
    event_log.abort();

    tracing::info!("Worker shutdown complete");
    Ok(())
}

async fn seed_demo_tasks(engine: &TaskEngine, count: usize) -> Result<()> {
    for n in 0..count {
        let priority = TaskPriority::ALL[n % TaskPriority::ALL.len()];
        let (task_type, payload) = if n % 2 == 0 {
            ("echo", json!({ "n": n }))
        } else {
            ("sleep", json!({ "millis": 100 + (n as u64 % 5) * 100 }))
        };
        engine
            .schedule_task(
                task_type,
                payload,
                ScheduleOptions::new()
                    .with_priority(priority)
                    .with_tag("demo"),
            )
            .await
            .with_context(|| format!("Failed to schedule demo task {n}"))?;
    }
    tracing::info!(count, "Seeded demo tasks");
    Ok(())
}
