//! Coordinator - エージェントと運用者が呼ぶ API
//!
//! 各コンポーネントの薄いファサード。すべての呼び出しは共有ストアを通るため、
//! 同じ永続ストア上の coordinator は何個あっても 1 つとして振る舞う。

use std::sync::Arc;

use crate::app::cancel::{CancelReport, CancellationCoordinator};
use crate::app::claim::{ClaimManager, FailOutcome};
use crate::app::graph::DependencyGraph;
use crate::app::lease_monitor::{LeaseMonitor, LeaseMonitorHandle, SweepReport};
use crate::app::status::RunStatusTracker;
use crate::config::HeddleConfig;
use crate::domain::{
    AgentId, CancelMode, CancelTarget, Preset, PresetParams, Result, RunId, RunStatusReport, Task,
    TaskId,
};
use crate::ports::{ReadyFilter, TaskStore};

pub struct Coordinator {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) graph: Arc<DependencyGraph>,
    pub(crate) claims: Arc<ClaimManager>,
    pub(crate) cancel: Arc<CancellationCoordinator>,
    pub(crate) status: RunStatusTracker,
    pub(crate) monitor: Arc<LeaseMonitor>,
    pub(crate) config: HeddleConfig,
}

impl Coordinator {
    pub fn config(&self) -> &HeddleConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// claim / renew ごとに付与する lease 期間
    pub fn lease_duration(&self) -> chrono::Duration {
        self.claims.lease_duration()
    }

    /// preset を展開し、run と全タスクを作成する
    pub async fn create_pipeline_run(&self, preset: Preset, params: PresetParams) -> Result<RunId> {
        self.graph.create_run(preset, params).await
    }

    /// `Ok(None)` は「実行可能なタスクなし」
    pub async fn claim_task(
        &self,
        agent_id: &AgentId,
        run_id: Option<RunId>,
        stage: Option<&str>,
    ) -> Result<Option<Task>> {
        let filter = ReadyFilter {
            run_id,
            stage: stage.map(str::to_string),
        };
        self.claims.claim(agent_id, &filter).await
    }

    pub async fn claim_matching(
        &self,
        agent_id: &AgentId,
        filter: &ReadyFilter,
    ) -> Result<Option<Task>> {
        self.claims.claim(agent_id, filter).await
    }

    pub async fn claim_task_with_lease(
        &self,
        agent_id: &AgentId,
        filter: &ReadyFilter,
        lease: chrono::Duration,
    ) -> Result<Option<Task>> {
        self.claims.claim_for(agent_id, filter, lease).await
    }

    pub async fn renew_lease(&self, task_id: TaskId, agent_id: &AgentId) -> Result<Task> {
        self.claims.renew(task_id, agent_id).await
    }

    pub async fn start_task(&self, task_id: TaskId, agent_id: &AgentId) -> Result<Task> {
        self.claims.start(task_id, agent_id).await
    }

    pub async fn complete_task(
        &self,
        task_id: TaskId,
        agent_id: &AgentId,
        result: serde_json::Value,
    ) -> Result<Task> {
        self.claims.complete(task_id, agent_id, result).await
    }

    pub async fn fail_task(
        &self,
        task_id: TaskId,
        agent_id: &AgentId,
        error: impl Into<String>,
    ) -> Result<FailOutcome> {
        self.claims.fail(task_id, agent_id, error).await
    }

    pub async fn cancel(&self, target: &CancelTarget, mode: CancelMode) -> Result<CancelReport> {
        self.cancel.cancel(target, mode).await
    }

    pub async fn get_run_status(&self, run_id: RunId) -> Result<RunStatusReport> {
        self.status.report(run_id).await
    }

    /// lease sweep を 1 回。時刻を自前で進める呼び出し側向け
    pub async fn sweep_leases(&self) -> Result<SweepReport> {
        self.monitor.sweep_once().await
    }

    /// 設定間隔でバックグラウンドの lease 監視を開始する
    pub fn spawn_lease_monitor(&self) -> LeaseMonitorHandle {
        self.monitor
            .clone()
            .spawn(self.config.lease.sweep_interval())
    }
}
