//! CancellationCoordinator - 依存先インデックス上の cascade
//!
//! cascade は 2 フェーズで進む：
//! 1. 収集: seed から依存先インデックスを visited 付きで幅優先に辿る。
//!    影響範囲の各タスクは 1 回だけ読む。収集した部分グラフはトポロジカル
//!    ソートし、循環があれば何も書かずに `GraphCycle` で中断する。
//! 2. 適用: 依存順に辿り、非終端タスクを CAS でキャンセルする。エージェントや
//!    sweep が同時に動かした場合は再読込して再試行する（回数は有限）。
//!    graceful では owner 付きタスクを残し、`cancel_requested` だけ立てる。
//!
//! 書き込むのは影響範囲のタスクのみ。終端タスクは飛ばすので、同じ cascade の
//! 再実行は no-op。

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use crate::app::status::RunStatusTracker;
use crate::domain::{
    CancelMode, CancelPolicy, CancelTarget, CascadeCause, DependencyIndex, HeddleError, Result,
    RunId, RunStatus, Task, TaskId, TaskStatus, TaskUpdate,
};
use crate::ports::{AbortNotice, AbortNotifier, TaskStore};

/// cascade が 1 タスクを諦めるまでの CAS 試行回数
const MAX_CAS_RETRIES: usize = 8;

/// cascade の結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CancelReport {
    /// 影響範囲のタスク数（seed を含む、重複なし）
    pub visited: usize,

    /// この呼び出しで `cancelled` にしたタスク（書き込み順）
    pub cancelled: Vec<TaskId>,

    /// graceful cancel が owner に任せたタスク
    pub left_running: Vec<TaskId>,

    /// 送った abort 通知の数
    pub notified: usize,
}

pub struct CancellationCoordinator {
    store: Arc<dyn TaskStore>,
    notifier: Arc<dyn AbortNotifier>,
    status: RunStatusTracker,
}

impl CancellationCoordinator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        notifier: Arc<dyn AbortNotifier>,
        status: RunStatusTracker,
    ) -> Self {
        Self {
            store,
            notifier,
            status,
        }
    }

    /// タスク・run のステージ・run 全体と、未完了の推移的な依存先をキャンセルする
    pub async fn cancel(&self, target: &CancelTarget, mode: CancelMode) -> Result<CancelReport> {
        let cause = CascadeCause::Cancel(target.scope(), mode);
        let (run_id, seeds) = self.seeds(target).await?;

        tracing::info!(target = %target, mode = ?mode, seeds = seeds.len(), "cancelling");
        let report = self.cascade(seeds, cause).await?;

        let policy = CancelPolicy::lookup(cause);
        if policy.close_run {
            let note = CancelPolicy::reason(cause);
            self.store
                .update_run_status(run_id, RunStatus::Active, RunStatus::Cancelled, Some(note))
                .await?;
        } else {
            self.status.refresh(run_id).await?;
        }
        Ok(report)
    }

    /// 恒久的に失敗したタスクの下流をすべてキャンセルする
    pub async fn cascade_failure(&self, failed: &Task) -> Result<CancelReport> {
        let report = self
            .cascade(vec![failed.clone()], CascadeCause::UpstreamFailed)
            .await?;
        if !report.cancelled.is_empty() {
            tracing::warn!(
                task_id = %failed.id,
                cancelled = report.cancelled.len(),
                "failure cascaded to dependents"
            );
        }
        Ok(report)
    }

    async fn seeds(&self, target: &CancelTarget) -> Result<(RunId, Vec<Task>)> {
        match target {
            CancelTarget::Task { task_id } => {
                let task = self.store.read(*task_id).await?;
                Ok((task.run_id, vec![task]))
            }
            CancelTarget::Stage { run_id, stage } => {
                let tasks: Vec<Task> = self
                    .store
                    .run_tasks(*run_id)
                    .await?
                    .into_iter()
                    .filter(|task| &task.stage == stage)
                    .collect();
                if tasks.is_empty() {
                    return Err(HeddleError::InvalidPipeline(format!(
                        "{run_id} has no stage '{stage}'"
                    )));
                }
                Ok((*run_id, tasks))
            }
            CancelTarget::Run { run_id } => {
                let tasks = self.store.run_tasks(*run_id).await?;
                Ok((*run_id, tasks))
            }
        }
    }

    async fn cascade(&self, seeds: Vec<Task>, cause: CascadeCause) -> Result<CancelReport> {
        let policy = CancelPolicy::lookup(cause);
        let reason = CancelPolicy::reason(cause);

        // Phase 1: 影響範囲の収集
        let seed_ids: BTreeSet<TaskId> = seeds.iter().map(|task| task.id).collect();
        let mut visited: HashMap<TaskId, Task> = HashMap::new();
        let mut queue: VecDeque<TaskId> = VecDeque::new();
        for seed in seeds {
            queue.push_back(seed.id);
            visited.insert(seed.id, seed);
        }
        while let Some(task_id) = queue.pop_front() {
            for dependent in self.store.dependents_of(task_id).await? {
                if visited.contains_key(&dependent.id) {
                    continue;
                }
                queue.push_back(dependent.id);
                visited.insert(dependent.id, dependent);
            }
        }

        let order = DependencyIndex::induced_by(visited.values())
            .topological_order()
            .map_err(|stuck| {
                tracing::error!(tasks = stuck.len(), "dependency cycle found during cascade");
                HeddleError::GraphCycle { tasks: stuck }
            })?;

        // Phase 2: 依存順に適用
        let mut report = CancelReport {
            visited: visited.len(),
            ..CancelReport::default()
        };
        for task_id in order {
            if seed_ids.contains(&task_id) && !policy.include_seeds {
                continue;
            }
            let Some(snapshot) = visited.remove(&task_id) else {
                continue;
            };
            self.cancel_one(snapshot, policy, &reason, &mut report).await?;
        }

        tracing::debug!(
            visited = report.visited,
            cancelled = report.cancelled.len(),
            left_running = report.left_running.len(),
            "cascade finished"
        );
        Ok(report)
    }

    async fn cancel_one(
        &self,
        mut task: Task,
        policy: CancelPolicy,
        reason: &str,
        report: &mut CancelReport,
    ) -> Result<()> {
        for _ in 0..MAX_CAS_RETRIES {
            if task.status.is_terminal() {
                return Ok(());
            }
            if task.status.is_owned() && !policy.cancel_owned {
                if task.cancel_requested {
                    report.left_running.push(task.id);
                    return Ok(());
                }
                match self
                    .store
                    .compare_and_swap(task.id, &task.guard(), TaskUpdate::request_cancel(&task))
                    .await
                {
                    Ok(_) => {
                        tracing::debug!(task_id = %task.id, "owned task left to finish");
                        report.left_running.push(task.id);
                        return Ok(());
                    }
                    Err(HeddleError::Conflict { .. }) => {
                        task = self.store.read(task.id).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let update = TaskUpdate::release(TaskStatus::Cancelled, task.attempt_count)
                .with_error(reason);
            match self
                .store
                .compare_and_swap(task.id, &task.guard(), update)
                .await
            {
                Ok(_) => {
                    tracing::debug!(task_id = %task.id, previous = %task.status, "task cancelled");
                    report.cancelled.push(task.id);
                    if let (true, Some(agent_id)) = (policy.notify_owner, task.owner_id.clone()) {
                        self.notifier
                            .notify(AbortNotice {
                                task_id: task.id,
                                run_id: task.run_id,
                                agent_id,
                                reason: reason.to_string(),
                            })
                            .await;
                        report.notified += 1;
                    }
                    return Ok(());
                }
                Err(HeddleError::Conflict { .. }) => {
                    task = self.store.read(task.id).await?;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(task_id = %task.id, "gave up cancelling a contended task");
        Err(HeddleError::Conflict { task_id: task.id })
    }
}
