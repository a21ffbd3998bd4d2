//! Pipeline run record and status views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{RunId, TaskId};
use super::preset::{Preset, PresetParams};
use super::state::{RunStatus, TaskStatus};
use super::task::Task;

/// One instantiation of a preset as a concrete task DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub preset: Preset,
    pub params: PresetParams,
    pub status: RunStatus,

    /// Why the run ended, when it did not simply complete.
    pub note: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(id: RunId, preset: Preset, params: PresetParams, now: DateTime<Utc>) -> Self {
        Self {
            id,
            preset,
            params,
            status: RunStatus::Active,
            note: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub claimed: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn tally<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Claimed => counts.claimed += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Done => counts.done += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending
            + self.ready
            + self.claimed
            + self.running
            + self.done
            + self.failed
            + self.cancelled
    }

    pub fn non_terminal(&self) -> usize {
        self.pending + self.ready + self.claimed + self.running
    }

    /// Run status implied by the task counts alone.
    pub fn implied_run_status(&self) -> RunStatus {
        if self.non_terminal() > 0 || self.total() == 0 {
            RunStatus::Active
        } else if self.failed > 0 {
            RunStatus::Failed
        } else if self.cancelled > 0 {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        }
    }
}

/// A permanently failed task, surfaced for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub stage: String,
    pub attempt_count: u32,
    pub error: Option<String>,
}

/// Answer to `get_run_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run: PipelineRun,
    pub counts: StatusCounts,
    pub tasks: Vec<Task>,
    pub failures: Vec<TaskFailure>,
}

impl RunStatusReport {
    pub fn new(run: PipelineRun, mut tasks: Vec<Task>) -> Self {
        tasks.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        let counts = StatusCounts::tally(&tasks);
        let failures = tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Failed)
            .map(|task| TaskFailure {
                task_id: task.id,
                stage: task.stage.clone(),
                attempt_count: task.attempt_count,
                error: task.last_error.clone(),
            })
            .collect();
        Self {
            run,
            counts,
            tasks,
            failures,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.run.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn counts(pending: usize, done: usize, failed: usize, cancelled: usize) -> StatusCounts {
        StatusCounts {
            pending,
            done,
            failed,
            cancelled,
            ..StatusCounts::default()
        }
    }

    #[rstest]
    #[case::empty(counts(0, 0, 0, 0), RunStatus::Active)]
    #[case::in_flight(counts(1, 3, 1, 0), RunStatus::Active)]
    #[case::all_done(counts(0, 4, 0, 0), RunStatus::Completed)]
    #[case::failure_wins(counts(0, 2, 1, 3), RunStatus::Failed)]
    #[case::cancelled(counts(0, 2, 0, 1), RunStatus::Cancelled)]
    fn run_status_rolls_up_from_counts(#[case] counts: StatusCounts, #[case] expected: RunStatus) {
        assert_eq!(counts.implied_run_status(), expected);
    }
}
