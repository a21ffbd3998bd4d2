//! エラー定義と運用上の分類

use thiserror::Error;

use super::ids::{AgentId, RunId, TaskId};

/// エラーの運用上の分類
///
/// - Transient: 競合に負けた。呼び出し側エージェントが自力で回復する
///   （再試行、別候補、実行中の作業を破棄）
/// - Permanent: 不正な入力や終端の結果。再試行しても無意味
/// - Infrastructure: storage / config / io の障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum HeddleError {
    /// 保存済みレコードが期待した直前状態と一致しない
    #[error("conflict on {task_id}: record changed concurrently")]
    Conflict { task_id: TaskId },

    /// 呼び出し側はもう owner ではない。実行中の作業は破棄する
    #[error("lease on {task_id} is no longer held by {agent_id}")]
    LeaseExpired { task_id: TaskId, agent_id: AgentId },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("pipeline run not found: {0}")]
    RunNotFound(RunId),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("dependency cycle detected among {} task(s)", tasks.len())]
    GraphCycle { tasks: Vec<TaskId> },

    #[error("{task_id} exhausted its retry budget after {attempts} attempt(s)")]
    MaxAttemptsExceeded { task_id: TaskId, attempts: u32 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HeddleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HeddleError::Conflict { .. } | HeddleError::LeaseExpired { .. } => {
                ErrorKind::Transient
            }
            HeddleError::TaskNotFound(_)
            | HeddleError::RunNotFound(_)
            | HeddleError::InvalidPipeline(_)
            | HeddleError::GraphCycle { .. }
            | HeddleError::MaxAttemptsExceeded { .. } => ErrorKind::Permanent,
            HeddleError::Storage(_)
            | HeddleError::Config(_)
            | HeddleError::Serialization(_)
            | HeddleError::Io(_) => ErrorKind::Infrastructure,
        }
    }

    /// エージェントループが自力で処理するエラー（運用者には見せない）
    pub fn is_recoverable_locally(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<sqlx::Error> for HeddleError {
    fn from(e: sqlx::Error) -> Self {
        HeddleError::Storage(e.to_string())
    }
}

impl From<toml::de::Error> for HeddleError {
    fn from(e: toml::de::Error) -> Self {
        HeddleError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HeddleError>;
