//! ClaimManager - ストアの CAS 上の claim / renew / start / complete / fail
//!
//! プロセス内ロックは持たない。すべての遷移は、呼び出し側が検証した
//! スナップショットを条件とする 1 回の compare-and-swap。
//! 競合に負けたら再読込・再検証する（回数は有限）。

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;

use crate::app::cancel::CancellationCoordinator;
use crate::app::graph::DependencyGraph;
use crate::app::status::RunStatusTracker;
use crate::domain::{AgentId, HeddleError, Result, Task, TaskId, TaskStatus, TaskUpdate};
use crate::ports::{Clock, ReadyFilter, TaskStore};

/// renew / start / complete / fail の再読込・再検証の上限回数
const MAX_CAS_RETRIES: usize = 4;

/// `fail` がタスクをどう扱ったか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    /// `ready` に戻した。`attempt` はこれまでの失敗回数
    Requeued { attempt: u32 },

    /// 再試行回数を使い切った。タスクは `failed`、依存先はキャンセル済み
    Exhausted { attempts: u32 },

    /// 作業中にキャンセルされた。タスクは `cancelled` で再試行しない
    Ignored,
}

/// attempt を終わらせる理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RetireReason {
    Failed(String),
    LeaseExpired,
}

enum Ownership {
    Held(Task),
    Cancelled(Task),
}

pub struct ClaimManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    graph: Arc<DependencyGraph>,
    cancel: Arc<CancellationCoordinator>,
    status: RunStatusTracker,
    lease: Duration,
    max_candidates: usize,
}

impl ClaimManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        graph: Arc<DependencyGraph>,
        cancel: Arc<CancellationCoordinator>,
        lease: Duration,
        max_candidates: usize,
    ) -> Self {
        Self {
            status: RunStatusTracker::new(store.clone()),
            store,
            clock,
            graph,
            cancel,
            lease,
            max_candidates,
        }
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease
    }

    /// `filter` に合う最古の ready タスクをデフォルト lease で claim する
    ///
    /// `Ok(None)` は実行可能なタスクなし。ready が無いか、K 件の候補すべてを
    /// 他のエージェントに先に取られた。
    pub async fn claim(&self, agent_id: &AgentId, filter: &ReadyFilter) -> Result<Option<Task>> {
        self.claim_for(agent_id, filter, self.lease).await
    }

    pub async fn claim_for(
        &self,
        agent_id: &AgentId,
        filter: &ReadyFilter,
        lease: Duration,
    ) -> Result<Option<Task>> {
        let candidates = self.store.scan_ready(filter, self.max_candidates).await?;

        for candidate in candidates {
            let expiry = self.clock.now() + lease;
            let update = TaskUpdate::claim(&candidate, agent_id.clone(), expiry);
            match self
                .store
                .compare_and_swap(candidate.id, &candidate.guard(), update)
                .await
            {
                Ok(task) => {
                    tracing::info!(task_id = %task.id, agent_id = %agent_id, stage = %task.stage, "task claimed");
                    return Ok(Some(task));
                }
                Err(HeddleError::Conflict { .. }) => {
                    tracing::debug!(task_id = %candidate.id, agent_id = %agent_id, "lost claim race");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// 呼び出し側の lease をデフォルト期間だけ延長する
    pub async fn renew(&self, task_id: TaskId, agent_id: &AgentId) -> Result<Task> {
        for _ in 0..MAX_CAS_RETRIES {
            let task = match self.ownership(task_id, agent_id).await? {
                Ownership::Held(task) => task,
                Ownership::Cancelled(_) => return Err(lease_lost(task_id, agent_id)),
            };

            let mut update = TaskUpdate::status_only(&task, task.status);
            update.lease_expiry = Some(self.clock.now() + self.lease);
            match self.store.compare_and_swap(task_id, &task.guard(), update).await {
                Ok(renewed) => {
                    tracing::debug!(task_id = %task_id, agent_id = %agent_id, "lease renewed");
                    return Ok(renewed);
                }
                Err(HeddleError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(HeddleError::Conflict { task_id })
    }

    /// owner が作業開始を通知する（`claimed -> running`）
    pub async fn start(&self, task_id: TaskId, agent_id: &AgentId) -> Result<Task> {
        for _ in 0..MAX_CAS_RETRIES {
            let task = match self.ownership(task_id, agent_id).await? {
                Ownership::Held(task) => task,
                Ownership::Cancelled(_) => return Err(lease_lost(task_id, agent_id)),
            };
            if task.status == TaskStatus::Running {
                return Ok(task);
            }

            let update = TaskUpdate::status_only(&task, TaskStatus::Running);
            match self.store.compare_and_swap(task_id, &task.guard(), update).await {
                Ok(running) => {
                    tracing::debug!(task_id = %task_id, agent_id = %agent_id, "task running");
                    return Ok(running);
                }
                Err(HeddleError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(HeddleError::Conflict { task_id })
    }

    /// タスクを done にし、ready になった依存先を昇格させる
    ///
    /// 作業中にキャンセルされたタスクの complete は受理するが何も変えない。
    pub async fn complete(
        &self,
        task_id: TaskId,
        agent_id: &AgentId,
        result: serde_json::Value,
    ) -> Result<Task> {
        for _ in 0..MAX_CAS_RETRIES {
            let task = match self.ownership(task_id, agent_id).await? {
                Ownership::Held(task) => task,
                Ownership::Cancelled(task) => {
                    tracing::info!(task_id = %task_id, agent_id = %agent_id, "completion of cancelled task ignored");
                    return Ok(task);
                }
            };

            let update = TaskUpdate::release(TaskStatus::Done, task.attempt_count)
                .with_result(result.clone());
            match self.store.compare_and_swap(task_id, &task.guard(), update).await {
                Ok(done) => {
                    tracing::info!(task_id = %task_id, agent_id = %agent_id, "task done");
                    self.after_done(&done).await;
                    return Ok(done);
                }
                Err(HeddleError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(HeddleError::Conflict { task_id })
    }

    /// attempt の失敗を報告する。再試行回数が尽きるまでタスクは再投入される
    pub async fn fail(
        &self,
        task_id: TaskId,
        agent_id: &AgentId,
        error: impl Into<String>,
    ) -> Result<FailOutcome> {
        let error = error.into();
        for _ in 0..MAX_CAS_RETRIES {
            let task = match self.ownership(task_id, agent_id).await? {
                Ownership::Held(task) => task,
                Ownership::Cancelled(_) => {
                    tracing::info!(task_id = %task_id, agent_id = %agent_id, "failure of cancelled task ignored");
                    return Ok(FailOutcome::Ignored);
                }
            };

            match self
                .retire_attempt(&task, RetireReason::Failed(error.clone()))
                .await
            {
                Err(HeddleError::Conflict { .. }) => continue,
                other => return other,
            }
        }
        Err(HeddleError::Conflict { task_id })
    }

    /// attempt から所有権を外し、タスクを再投入・失敗・キャンセルのいずれかにする
    ///
    /// graceful cancel 待ちのタスクや、既に閉じた run のタスクは `cancelled` で終わる。
    /// `snapshot` に対する 1 回の CAS。`Conflict` はタスクが先に進んだことを示し、
    /// 何も書き込んでいない。
    pub(crate) async fn retire_attempt(
        &self,
        snapshot: &Task,
        reason: RetireReason,
    ) -> Result<FailOutcome> {
        let attempt = snapshot.attempt_count + 1;
        let cancelled = snapshot.cancel_requested
            || self.store.read_run(snapshot.run_id).await?.status.is_terminal();
        let exhausted = !cancelled && attempt > snapshot.max_attempts;

        let error = match (&reason, exhausted) {
            (RetireReason::Failed(error), _) => error.clone(),
            (RetireReason::LeaseExpired, false) => "lease expired".to_string(),
            (RetireReason::LeaseExpired, true) => "lease expired: max attempts exceeded".to_string(),
        };
        let status = match (cancelled, exhausted) {
            (true, _) => TaskStatus::Cancelled,
            (false, true) => TaskStatus::Failed,
            (false, false) => TaskStatus::Ready,
        };
        let update = TaskUpdate::release(status, attempt).with_error(error);
        let retired = self
            .store
            .compare_and_swap(snapshot.id, &snapshot.guard(), update)
            .await?;

        if cancelled {
            tracing::info!(task_id = %retired.id, reason = ?reason, "cancelled task not requeued");
            self.status.refresh(retired.run_id).await?;
            return Ok(FailOutcome::Ignored);
        }

        if !exhausted {
            tracing::info!(task_id = %retired.id, attempt, reason = ?reason, "task requeued");
            return Ok(FailOutcome::Requeued { attempt });
        }

        let exceeded = HeddleError::MaxAttemptsExceeded {
            task_id: retired.id,
            attempts: attempt,
        };
        tracing::warn!(task_id = %retired.id, error = %exceeded, "task failed permanently");
        self.cancel.cascade_failure(&retired).await?;
        self.status.refresh(retired.run_id).await?;
        Ok(FailOutcome::Exhausted { attempts: attempt })
    }

    /// `done` 確定後の ready 伝播と run の roll-up
    ///
    /// 結果は保存済み。ここでのエラーはログに残し、エージェントには返さない。
    async fn after_done(&self, done: &Task) {
        match self.graph.on_task_done(done.id).await {
            Ok(promoted) if !promoted.is_empty() => {
                tracing::debug!(task_id = %done.id, promoted = promoted.len(), "dependents ready");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(task_id = %done.id, error = %e, "readiness propagation failed");
            }
        }
        if let Err(e) = self.status.refresh(done.run_id).await {
            tracing::error!(run_id = %done.run_id, error = %e, "run status refresh failed");
        }
    }

    async fn ownership(&self, task_id: TaskId, agent_id: &AgentId) -> Result<Ownership> {
        let task = self.store.read(task_id).await?;
        match task.status {
            TaskStatus::Cancelled => Ok(Ownership::Cancelled(task)),
            TaskStatus::Done | TaskStatus::Failed => Err(HeddleError::Conflict { task_id }),
            _ if !task.is_owned_by(agent_id) => Err(lease_lost(task_id, agent_id)),
            _ if task.lease_expired_at(self.clock.now()) => Err(lease_lost(task_id, agent_id)),
            _ => Ok(Ownership::Held(task)),
        }
    }
}

fn lease_lost(task_id: TaskId, agent_id: &AgentId) -> HeddleError {
    HeddleError::LeaseExpired {
        task_id,
        agent_id: agent_id.clone(),
    }
}
