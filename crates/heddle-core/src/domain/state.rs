//! task / run の状態機械

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// タスクの状態
///
/// 状態遷移:
/// - Pending -> Ready（依存がすべて done）
/// - Ready -> Claimed -> Running -> Done
/// - Claimed/Running -> Ready（失敗または lease 切れ、試行回数が残っている）
/// - Claimed/Running -> Failed（試行回数切れ）
/// - 非終端 -> Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 依存待ち
    Pending,

    /// 依存がすべて done。claim 可能
    Ready,

    /// エージェントが所有、実行開始は未通知
    Claimed,

    /// エージェントが所有し、payload を実行中
    Running,

    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Claimed,
        TaskStatus::Running,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// 終端状態は二度と変更されない
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// owner と lease を持つ状態
    pub fn is_owned(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ストアや CLI から読んだ未知の状態文字列のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// pipeline run の状態（タスクから集約）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// 非終端のタスクが 1 つ以上ある
    Active,

    /// 全タスクが done
    Completed,

    /// 全タスクが終端で、1 つ以上 failed
    Failed,

    /// 運用者がキャンセルした、または全タスクが終端でキャンセルを含む
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Active => "active",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            RunStatus::Active,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
        .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::pending(TaskStatus::Pending, false, false)]
    #[case::ready(TaskStatus::Ready, false, false)]
    #[case::claimed(TaskStatus::Claimed, false, true)]
    #[case::running(TaskStatus::Running, false, true)]
    #[case::done(TaskStatus::Done, true, false)]
    #[case::failed(TaskStatus::Failed, true, false)]
    #[case::cancelled(TaskStatus::Cancelled, true, false)]
    fn task_status_classification(
        #[case] status: TaskStatus,
        #[case] terminal: bool,
        #[case] owned: bool,
    ) {
        assert_eq!(status.is_terminal(), terminal);
        assert_eq!(status.is_owned(), owned);
        assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
    }

    #[test]
    fn serde_uses_snake_case_names() {
        let json = serde_json::to_string(&TaskStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        let run: RunStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(run, RunStatus::Completed);
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("paused".parse::<TaskStatus>().is_err());
        assert!("paused".parse::<RunStatus>().is_err());
    }
}
