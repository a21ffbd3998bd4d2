//! TaskStore port - task / run / 所有権の正本（source of truth）
//!
//! # 契約
//! - 更新系の呼び出しはそれぞれ 1 つのアトミックなトランザクション
//! - 作成後のタスク変更は `compare_and_swap` のみ。単一所有を保証する唯一の
//!   プリミティブでもある。保存済みの `(status, owner_id, lease_expiry,
//!   attempt_count, cancel_requested)` が guard と一致した場合のみ適用し、
//!   不一致なら `Conflict`（レコードは変更なし）
//! - 終端状態を指す guard は決して一致しない。終端タスクは二度と変更されない
//! - scan はスナップショットを返す。呼び出し側は CAS 経由でのみ操作する

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    PipelineRun, Preset, PresetParams, Result, RunId, RunStatus, Task, TaskGuard, TaskId,
    TaskSpec, TaskUpdate,
};

/// 候補 scan の絞り込み条件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadyFilter {
    pub run_id: Option<RunId>,
    pub stage: Option<String>,
}

impl ReadyFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn run(run_id: RunId) -> Self {
        Self {
            run_id: Some(run_id),
            stage: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.run_id.is_none_or(|run_id| task.run_id == run_id)
            && self.stage.as_deref().is_none_or(|stage| task.stage == stage)
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// `active` な run を新規作成し、その ID を返す
    async fn create_run(&self, preset: Preset, params: PresetParams) -> Result<RunId>;

    /// タスクのバッチを `run_id` に投入する（all or nothing）
    ///
    /// `depends_on` はバッチ内か同じ run の既存タスクを指し、バッチは非巡回で
    /// なければならない。違反時は `InvalidPipeline` で何も書かない。
    /// 依存がすべて done なら `ready`、そうでなければ `pending` で始まる。
    async fn create_tasks(&self, run_id: RunId, specs: Vec<TaskSpec>) -> Result<Vec<Task>>;

    /// 保存済みタスクが `expected` と完全一致する場合のみ `update` を適用
    ///
    /// 書き込み後のタスクを返す。不一致は `Conflict`、未知の ID は `TaskNotFound`。
    async fn compare_and_swap(
        &self,
        task_id: TaskId,
        expected: &TaskGuard,
        update: TaskUpdate,
    ) -> Result<Task>;

    async fn read(&self, task_id: TaskId) -> Result<Task>;

    /// ready タスクを `(created_at, id)` 昇順で最大 `limit` 件
    async fn scan_ready(&self, filter: &ReadyFilter, limit: usize) -> Result<Vec<Task>>;

    /// lease が `now` 以前に切れた claimed/running タスク（古い lease 順、最大 `limit` 件）
    async fn scan_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>>;

    /// `depends_on` に `task_id` を含むタスク
    async fn dependents_of(&self, task_id: TaskId) -> Result<Vec<Task>>;

    /// run の全タスク（`(created_at, id)` 順）
    async fn run_tasks(&self, run_id: RunId) -> Result<Vec<Task>>;

    async fn read_run(&self, run_id: RunId) -> Result<PipelineRun>;

    /// run 単位の status CAS
    ///
    /// run がもう `expected` でなければ `false`（変更なし）。
    /// `note` は指定時のみ書き込む。
    async fn update_run_status(
        &self,
        run_id: RunId,
        expected: RunStatus,
        new: RunStatus,
        note: Option<String>,
    ) -> Result<bool>;
}
