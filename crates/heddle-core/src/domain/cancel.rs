//! Cancellation vocabulary: targets, modes and the policy table.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::{RunId, TaskId};

/// What to cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum CancelTarget {
    Task { task_id: TaskId },
    Stage { run_id: RunId, stage: String },
    Run { run_id: RunId },
}

impl CancelTarget {
    pub fn scope(&self) -> CancelScope {
        match self {
            CancelTarget::Task { .. } => CancelScope::Task,
            CancelTarget::Stage { .. } => CancelScope::Stage,
            CancelTarget::Run { .. } => CancelScope::Run,
        }
    }
}

impl fmt::Display for CancelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelTarget::Task { task_id } => write!(f, "{task_id}"),
            CancelTarget::Stage { run_id, stage } => write!(f, "{run_id}/{stage}"),
            CancelTarget::Run { run_id } => write!(f, "{run_id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelScope {
    Task,
    Stage,
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// Owned tasks finish naturally; everything not started is cancelled.
    #[default]
    Graceful,

    /// Owned tasks are cancelled too and their owners get an abort advisory.
    Immediate,
}

/// Why a cascade is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeCause {
    /// Operator or caller asked for it.
    Cancel(CancelScope, CancelMode),

    /// An upstream task failed permanently; its dependents can never run.
    UpstreamFailed,
}

/// How a cascade treats the tasks it visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelPolicy {
    /// Cancel tasks that are claimed or running.
    pub cancel_owned: bool,

    /// Send an abort advisory to the owner of a cancelled owned task.
    pub notify_owner: bool,

    /// Mark the run itself cancelled.
    pub close_run: bool,

    /// Whether the seed tasks themselves are cancelled (false when the seed is
    /// a task that already failed and only its dependents are affected).
    pub include_seeds: bool,
}

impl CancelPolicy {
    /// The policy table.
    pub fn lookup(cause: CascadeCause) -> Self {
        use CancelMode::*;
        use CancelScope::*;

        match cause {
            CascadeCause::Cancel(Task | Stage, Graceful) => Self {
                cancel_owned: false,
                notify_owner: false,
                close_run: false,
                include_seeds: true,
            },
            CascadeCause::Cancel(Task | Stage, Immediate) => Self {
                cancel_owned: true,
                notify_owner: true,
                close_run: false,
                include_seeds: true,
            },
            CascadeCause::Cancel(Run, Graceful) => Self {
                cancel_owned: false,
                notify_owner: false,
                close_run: true,
                include_seeds: true,
            },
            CascadeCause::Cancel(Run, Immediate) => Self {
                cancel_owned: true,
                notify_owner: true,
                close_run: true,
                include_seeds: true,
            },
            // Dependents of a failed task are never owned: their dependencies
            // were not all done.
            CascadeCause::UpstreamFailed => Self {
                cancel_owned: false,
                notify_owner: false,
                close_run: false,
                include_seeds: false,
            },
        }
    }

    pub fn reason(cause: CascadeCause) -> String {
        match cause {
            CascadeCause::Cancel(scope, mode) => {
                format!("cancelled ({mode:?} {scope:?} cancellation)").to_lowercase()
            }
            CascadeCause::UpstreamFailed => "cancelled: upstream task failed".to_string(),
        }
    }
}
