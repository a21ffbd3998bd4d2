//! LeaseMonitor - renew が途絶えたタスクの回収
//!
//! sweep はストア経由でのみエージェントとやり取りする。回収は期限切れの
//! スナップショットに対する CAS なので、直前に renew された lease や
//! その間に完了したタスクは一致せず、スキップされる。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::app::claim::{ClaimManager, FailOutcome, RetireReason};
use crate::domain::{HeddleError, Result};
use crate::ports::{Clock, TaskStore};

/// sweep 1 回分の集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// 次の attempt のため `ready` に戻した
    pub reclaimed: usize,

    /// 試行回数切れ: failed、依存先はキャンセル
    pub exhausted: usize,

    /// graceful cancel が owner 待ちだった: `cancelled` にした
    pub cancelled: usize,

    /// 先に renew / 完了 / 回収された
    pub skipped: usize,
}

pub struct LeaseMonitor {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    claims: Arc<ClaimManager>,
    batch: usize,
}

impl LeaseMonitor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        claims: Arc<ClaimManager>,
        batch: usize,
    ) -> Self {
        Self {
            store,
            clock,
            claims,
            batch,
        }
    }

    /// 期限切れ lease を最大 1 バッチ分回収する
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let expired = self.store.scan_expired(now, self.batch).await?;
        let mut report = SweepReport::default();

        for task in expired {
            match self
                .claims
                .retire_attempt(&task, RetireReason::LeaseExpired)
                .await
            {
                Ok(FailOutcome::Requeued { .. }) => report.reclaimed += 1,
                Ok(FailOutcome::Exhausted { .. }) => report.exhausted += 1,
                Ok(FailOutcome::Ignored) => report.cancelled += 1,
                Err(HeddleError::Conflict { .. }) => {
                    tracing::debug!(task_id = %task.id, "expired lease changed before reclaim");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if report.reclaimed + report.exhausted + report.cancelled > 0 {
            tracing::info!(
                reclaimed = report.reclaimed,
                exhausted = report.exhausted,
                cancelled = report.cancelled,
                skipped = report.skipped,
                "lease sweep"
            );
        }
        Ok(report)
    }

    /// shutdown まで一定間隔で sweep する
    pub fn spawn(self: Arc<Self>, every: Duration) -> LeaseMonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }
                // ストアの一時的な失敗で止めない。次の tick で再試行
                if let Err(e) = self.sweep_once().await {
                    tracing::error!(error = %e, "lease sweep failed");
                }
            }
            tracing::debug!("lease monitor stopped");
        });

        LeaseMonitorHandle { shutdown_tx, join }
    }
}

/// 実行中の monitor へのハンドル。drop しても停止する
pub struct LeaseMonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl LeaseMonitorHandle {
    pub fn request_shutdown(&self) {
        // Receiver may already be gone.
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}
