//! タスクレコードと、それを中心とした compare-and-swap の語彙

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AgentId, RunId, TaskId};
use super::state::TaskStatus;

/// 保存されたタスク
///
/// 所有権の唯一の正本：
/// - `owner_id` と `lease_expiry` は両方あるか両方ないか
/// - 設定されるのは `status` が claimed / running の間だけ
///
/// `cancel_requested` は graceful cancel が owner に任せたタスクの印。
/// attempt がどう終わっても `ready` には戻らない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub run_id: RunId,
    pub stage: String,
    pub status: TaskStatus,
    pub owner_id: Option<AgentId>,
    pub lease_expiry: Option<DateTime<Utc>>,

    /// これまでの失敗・回収の回数
    pub attempt_count: u32,

    /// 恒久的な失敗までに許される再試行回数
    pub max_attempts: u32,

    pub depends_on: BTreeSet<TaskId>,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// 作成時に spec を実体化する
    pub fn from_spec(run_id: RunId, spec: TaskSpec, status: TaskStatus, now: DateTime<Utc>) -> Self {
        Self {
            id: spec.id,
            run_id,
            stage: spec.stage,
            status,
            owner_id: None,
            lease_expiry: None,
            attempt_count: 0,
            max_attempts: spec.max_attempts,
            depends_on: spec.depends_on,
            payload: spec.payload,
            result: None,
            last_error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// compare-and-swap の条件となるフィールドのスナップショット
    pub fn guard(&self) -> TaskGuard {
        TaskGuard {
            status: self.status,
            owner_id: self.owner_id.clone(),
            lease_expiry: self.lease_expiry,
            attempt_count: self.attempt_count,
            cancel_requested: self.cancel_requested,
        }
    }

    pub fn is_owned_by(&self, agent_id: &AgentId) -> bool {
        self.status.is_owned() && self.owner_id.as_ref() == Some(agent_id)
    }

    pub fn lease_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_expiry.is_some_and(|expiry| expiry <= now)
    }

    /// update をその場で適用（guard 一致後にストアが使う）
    pub fn apply(&mut self, update: TaskUpdate, now: DateTime<Utc>) {
        self.status = update.status;
        self.owner_id = update.owner_id;
        self.lease_expiry = update.lease_expiry;
        self.attempt_count = update.attempt_count;
        self.cancel_requested = update.cancel_requested;
        if update.result.is_some() {
            self.result = update.result;
        }
        if update.last_error.is_some() {
            self.last_error = update.last_error;
        }
        self.updated_at = now;
    }
}

/// 作成するもの：preset 展開が生成し、`TaskStore::create_tasks` が消費する
///
/// ID は投入前に割り当てるので、`depends_on` は同じバッチの兄弟を参照できる。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub stage: String,
    pub depends_on: BTreeSet<TaskId>,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

/// compare-and-swap で期待する直前状態
///
/// `attempt_count` は単調増加なので guard に含める。claimed -> ready -> claimed と
/// 進んだタスクが古い guard に一致することはない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGuard {
    pub status: TaskStatus,
    pub owner_id: Option<AgentId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub cancel_requested: bool,
}

/// compare-and-swap 成功時に書き込む新しい状態
///
/// `result` と `last_error` は `Some` のときだけ上書きする。
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub owner_id: Option<AgentId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
}

impl TaskUpdate {
    /// 所有権とカウンタはそのまま、status だけ変える
    pub fn status_only(task: &Task, status: TaskStatus) -> Self {
        Self {
            status,
            owner_id: task.owner_id.clone(),
            lease_expiry: task.lease_expiry,
            attempt_count: task.attempt_count,
            result: None,
            last_error: None,
            cancel_requested: task.cancel_requested,
        }
    }

    /// owner の作業は続けさせ、再投入されないよう印を付ける
    pub fn request_cancel(task: &Task) -> Self {
        Self {
            cancel_requested: true,
            ..Self::status_only(task, task.status)
        }
    }

    /// 所有権を取る
    pub fn claim(task: &Task, agent_id: AgentId, lease_expiry: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Claimed,
            owner_id: Some(agent_id),
            lease_expiry: Some(lease_expiry),
            attempt_count: task.attempt_count,
            result: None,
            last_error: None,
            cancel_requested: false,
        }
    }

    /// 所有権を手放し `status` に移る
    pub fn release(status: TaskStatus, attempt_count: u32) -> Self {
        Self {
            status,
            owner_id: None,
            lease_expiry: None,
            attempt_count,
            result: None,
            last_error: None,
            cancel_requested: false,
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// owner と lease は同時に、所有状態のときだけ設定する。
    /// キャンセル待ちの印を持てるのも所有中のタスクだけ
    pub fn is_consistent(&self) -> bool {
        let owned = self.owner_id.is_some();
        owned == self.lease_expiry.is_some()
            && owned == self.status.is_owned()
            && (owned || !self.cancel_requested)
    }
}
