//! Run status - タスクが終端に遷移した後の roll-up と、運用者向けビュー

use std::sync::Arc;

use crate::domain::{Result, RunId, RunStatus, RunStatusReport, StatusCounts};
use crate::ports::TaskStore;

/// タスクから run の status を導出する
///
/// roll-up は run を `active` から動かすだけ。終端の run status は確定で、
/// ストアの run 単位 CAS がそれを保証する。
#[derive(Clone)]
pub struct RunStatusTracker {
    store: Arc<dyn TaskStore>,
}

impl RunStatusTracker {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// run の status を再計算して保存し、保存済みの status を返す
    pub async fn refresh(&self, run_id: RunId) -> Result<RunStatus> {
        let run = self.store.read_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run.status);
        }

        let tasks = self.store.run_tasks(run_id).await?;
        let counts = StatusCounts::tally(&tasks);
        let implied = counts.implied_run_status();
        if implied == RunStatus::Active {
            return Ok(RunStatus::Active);
        }

        let note = match implied {
            RunStatus::Failed => Some(format!("{} task(s) failed", counts.failed)),
            RunStatus::Cancelled => Some(format!("{} task(s) cancelled", counts.cancelled)),
            _ => None,
        };
        if self
            .store
            .update_run_status(run_id, RunStatus::Active, implied, note)
            .await?
        {
            tracing::info!(run_id = %run_id, status = %implied, "run finished");
            return Ok(implied);
        }
        // 他の呼び出しが先に閉じた
        Ok(self.store.read_run(run_id).await?.status)
    }

    pub async fn report(&self, run_id: RunId) -> Result<RunStatusReport> {
        let run = self.store.read_run(run_id).await?;
        let tasks = self.store.run_tasks(run_id).await?;
        Ok(RunStatusReport::new(run, tasks))
    }
}
