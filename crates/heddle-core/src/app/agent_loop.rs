//! エージェントループの参照実装 - claim → start → renew しながら実行 → 報告
//!
//! エージェントは API の通常の呼び出し側にすぎない。
//! デモとシナリオテストはこのループを使い、外部エージェントの雛形にもなる。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::app::coordinator::Coordinator;
use crate::domain::{AgentId, HeddleError, Task, TaskId};
use crate::impls::BroadcastAbortNotifier;
use crate::ports::{AbortNotice, ReadyFilter};

/// 作業本体。`Err` は `fail_task` で報告するエラーメッセージ
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> std::result::Result<serde_json::Value, String>;
}

#[derive(Clone)]
pub struct AgentOptions {
    /// Agents are named `{prefix}-{n}`.
    pub name_prefix: String,
    pub filter: ReadyFilter,

    /// 「実行可能なタスクなし」の後の待機
    pub idle_backoff: Duration,

    /// immediate cancel の abort 通知の受信元
    pub aborts: Option<BroadcastAbortNotifier>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            name_prefix: "agent".into(),
            filter: ReadyFilter::any(),
            idle_backoff: Duration::from_millis(25),
            aborts: None,
        }
    }
}

/// エージェント群のハンドル
/// - `request_shutdown` で claim を止める。実行中の作業は完了・報告まで続く
/// - `shutdown_and_join` は全エージェントの終了を待つ
pub struct AgentGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl AgentGroup {
    /// エージェントを `n` 個起動
    pub fn spawn(
        n: usize,
        coordinator: Arc<Coordinator>,
        executor: Arc<dyn TaskExecutor>,
        options: AgentOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for n in 0..n {
            let agent = Agent {
                id: AgentId::new(format!("{}-{n}", options.name_prefix)),
                coordinator: Arc::clone(&coordinator),
                executor: Arc::clone(&executor),
                filter: options.filter.clone(),
                idle_backoff: options.idle_backoff,
            };
            let aborts = options.aborts.as_ref().map(BroadcastAbortNotifier::subscribe);
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(agent.run(rx, aborts)));
        }

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // Receivers may already be dropped.
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

enum Attempt {
    Finished(std::result::Result<serde_json::Value, String>),
    Aborted(AbortNotice),
    LeaseLost(HeddleError),
}

struct Agent {
    id: AgentId,
    coordinator: Arc<Coordinator>,
    executor: Arc<dyn TaskExecutor>,
    filter: ReadyFilter,
    idle_backoff: Duration,
}

impl Agent {
    async fn run(
        self,
        mut shutdown_rx: watch::Receiver<bool>,
        mut aborts: Option<broadcast::Receiver<AbortNotice>>,
    ) {
        tracing::debug!(agent_id = %self.id, "agent started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let claimed = self.coordinator.claim_matching(&self.id, &self.filter).await;
            let task = match claimed {
                Ok(Some(task)) => task,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(self.idle_backoff) => {}
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(agent_id = %self.id, error = %e, "claim failed");
                    tokio::time::sleep(self.idle_backoff).await;
                    continue;
                }
            };

            if let Err(e) = self.work_on(task, &mut aborts).await {
                if e.is_recoverable_locally() {
                    tracing::debug!(agent_id = %self.id, error = %e, "work discarded");
                } else {
                    tracing::warn!(agent_id = %self.id, error = %e, "reporting task failed");
                }
            }
        }
        tracing::debug!(agent_id = %self.id, "agent stopped");
    }

    async fn work_on(
        &self,
        task: Task,
        aborts: &mut Option<broadcast::Receiver<AbortNotice>>,
    ) -> crate::domain::Result<()> {
        let task = self.coordinator.start_task(task.id, &self.id).await?;

        let renew_every = self
            .coordinator
            .lease_duration()
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            / 3;
        let mut renew = tokio::time::interval(renew_every);
        // 最初の tick は即時に完了する。lease は付与されたばかり
        renew.tick().await;

        let work = self.executor.execute(&task);
        tokio::pin!(work);
        let attempt = loop {
            tokio::select! {
                result = &mut work => break Attempt::Finished(result),
                notice = next_abort(aborts, task.id) => break Attempt::Aborted(notice),
                _ = renew.tick() => {
                    if let Err(e) = self.coordinator.renew_lease(task.id, &self.id).await {
                        if e.is_recoverable_locally() {
                            break Attempt::LeaseLost(e);
                        }
                        tracing::warn!(task_id = %task.id, error = %e, "lease renewal failed");
                    }
                }
            }
        };

        match attempt {
            Attempt::Finished(Ok(result)) => {
                self.coordinator
                    .complete_task(task.id, &self.id, result)
                    .await?;
            }
            Attempt::Finished(Err(error)) => {
                let outcome = self.coordinator.fail_task(task.id, &self.id, error).await?;
                tracing::debug!(task_id = %task.id, outcome = ?outcome, "attempt failed");
            }
            Attempt::Aborted(notice) => {
                tracing::info!(task_id = %task.id, reason = %notice.reason, "work aborted");
            }
            Attempt::LeaseLost(e) => return Err(e),
        }
        Ok(())
    }
}

async fn next_abort(
    aborts: &mut Option<broadcast::Receiver<AbortNotice>>,
    task_id: TaskId,
) -> AbortNotice {
    let Some(rx) = aborts else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(notice) if notice.task_id == task_id => return notice,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::CoordinatorBuilder;
    use crate::domain::{CancelMode, CancelTarget, Preset, PresetParams, RunId, RunStatus, TaskStatus};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Fails the first attempt of every `review` task.
    #[derive(Default)]
    struct FlakyReviewer {
        failed_once: Mutex<HashSet<TaskId>>,
    }

    #[async_trait]
    impl TaskExecutor for FlakyReviewer {
        async fn execute(&self, task: &Task) -> std::result::Result<serde_json::Value, String> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if task.stage == "review" && self.failed_once.lock().unwrap().insert(task.id) {
                return Err("transient reviewer error".into());
            }
            Ok(serde_json::json!({"stage": task.stage}))
        }
    }

    struct Stuck;

    #[async_trait]
    impl TaskExecutor for Stuck {
        async fn execute(&self, _task: &Task) -> std::result::Result<serde_json::Value, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(serde_json::Value::Null)
        }
    }

    async fn wait_for_run(coordinator: &Coordinator, run_id: RunId) -> RunStatus {
        for _ in 0..400 {
            let status = coordinator.get_run_status(run_id).await.unwrap().status();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        RunStatus::Active
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn agents_drive_a_run_through_retries() {
        let coordinator = Arc::new(CoordinatorBuilder::new().build().unwrap());
        let run_id = coordinator
            .create_pipeline_run(Preset::Review, PresetParams::default())
            .await
            .unwrap();

        let group = AgentGroup::spawn(
            3,
            coordinator.clone(),
            Arc::new(FlakyReviewer::default()),
            AgentOptions::default(),
        );
        assert_eq!(wait_for_run(&coordinator, run_id).await, RunStatus::Completed);
        group.shutdown_and_join().await;

        let report = coordinator.get_run_status(run_id).await.unwrap();
        for task in report.tasks.iter().filter(|t| t.stage == "review") {
            assert_eq!(task.attempt_count, 1);
            assert_eq!(task.last_error.as_deref(), Some("transient reviewer error"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abort_advisory_stops_in_flight_work() {
        let notifier = BroadcastAbortNotifier::default();
        let coordinator = Arc::new(
            CoordinatorBuilder::new()
                .notifier(Arc::new(notifier.clone()))
                .build()
                .unwrap(),
        );
        let run_id = coordinator
            .create_pipeline_run(Preset::Research, PresetParams::default())
            .await
            .unwrap();

        let group = AgentGroup::spawn(
            1,
            coordinator.clone(),
            Arc::new(Stuck),
            AgentOptions {
                aborts: Some(notifier),
                ..AgentOptions::default()
            },
        );

        let mut running = None;
        for _ in 0..200 {
            let report = coordinator.get_run_status(run_id).await.unwrap();
            running = report.tasks.into_iter().find(|t| t.status == TaskStatus::Running);
            if running.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let running = running.expect("agent never started the first task");

        coordinator
            .cancel(&CancelTarget::Run { run_id }, CancelMode::Immediate)
            .await
            .unwrap();
        // Returns only if the stuck executor was abandoned.
        tokio::time::timeout(Duration::from_secs(5), group.shutdown_and_join())
            .await
            .unwrap();

        let task = coordinator.store().read(running.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }
}
