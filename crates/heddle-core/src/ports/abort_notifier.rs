//! AbortNotifier port - 実行中にキャンセルされたタスクの owner への通知
//!
//! 配送は保証しない（best-effort）。通知を取りこぼしたエージェントも、
//! 次の renew/complete 呼び出しでキャンセルを知る。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{AgentId, RunId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortNotice {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub agent_id: AgentId,
    pub reason: String,
}

#[async_trait]
pub trait AbortNotifier: Send + Sync {
    /// 失敗しない。通知の欠落はエラーではない
    async fn notify(&self, notice: AbortNotice);
}
