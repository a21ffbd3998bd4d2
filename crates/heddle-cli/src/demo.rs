//! `heddle demo`: a preset run driven by simulated agents in one process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use heddle_core::app::{AgentGroup, AgentOptions, TaskExecutor};
use heddle_core::domain::{CancelMode, CancelTarget, Preset, PresetParams, RunStatusReport, Task};
use heddle_core::impls::BroadcastAbortNotifier;
use heddle_core::{CoordinatorBuilder, HeddleConfig};
use tokio::time::{Duration, sleep};

/// Sleeps a little, then fails with probability `fail_rate`.
struct SimulatedExecutor {
    fail_rate: f64,
    attempts: AtomicU32,
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, String> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let work_ms = 10 + rand::random::<u64>() % 40;
        sleep(Duration::from_millis(work_ms)).await;

        if rand::random::<f64>() < self.fail_rate {
            return Err(format!("simulated failure in {} (attempt #{attempt})", task.stage));
        }
        Ok(serde_json::json!({
            "stage": task.stage,
            "index": task.payload["index"],
            "work_ms": work_ms,
        }))
    }
}

pub async fn run(
    mut config: HeddleConfig,
    preset: Preset,
    agents: usize,
    fail_rate: f64,
    width: Option<u32>,
) -> Result<RunStatusReport> {
    anyhow::ensure!(agents > 0, "--agents must be at least 1");
    anyhow::ensure!(
        (0.0..=1.0).contains(&fail_rate),
        "--fail-rate must be within 0..=1"
    );

    config.store = Default::default();
    let notifier = BroadcastAbortNotifier::default();
    let coordinator = Arc::new(
        CoordinatorBuilder::new()
            .config(config)
            .notifier(Arc::new(notifier.clone()))
            .build()?,
    );
    let monitor = coordinator.spawn_lease_monitor();

    let params = PresetParams {
        width,
        ..PresetParams::default()
    };
    let run_id = coordinator.create_pipeline_run(preset, params).await?;

    let executor = Arc::new(SimulatedExecutor {
        fail_rate,
        attempts: AtomicU32::new(0),
    });
    let group = AgentGroup::spawn(
        agents,
        coordinator.clone(),
        executor,
        AgentOptions {
            aborts: Some(notifier),
            ..AgentOptions::default()
        },
    );

    loop {
        let report = coordinator.get_run_status(run_id).await?;
        if report.status().is_terminal() {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(run_id = %run_id, "interrupted; cancelling run");
                coordinator
                    .cancel(&CancelTarget::Run { run_id }, CancelMode::Immediate)
                    .await?;
            }
            _ = sleep(Duration::from_millis(50)) => {}
        }
    }

    group.shutdown_and_join().await;
    monitor.shutdown_and_join().await;
    Ok(coordinator.get_run_status(run_id).await?)
}
