//! AbortNotifier 実装

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::ports::{AbortNotice, AbortNotifier};

/// 通知をログに残すだけ。別プロセスのエージェントは次の renew でキャンセルを知る
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAbortNotifier;

#[async_trait]
impl AbortNotifier for TracingAbortNotifier {
    async fn notify(&self, notice: AbortNotice) {
        tracing::info!(
            task_id = %notice.task_id,
            run_id = %notice.run_id,
            agent_id = %notice.agent_id,
            reason = %notice.reason,
            "abort advisory"
        );
    }
}

/// broadcast チャネルでプロセス内エージェントへ通知を配る
///
/// 各エージェントは subscribe して自分の ID で絞り込む。
/// 遅れた受信側や不在の受信側は通知を取りこぼすだけ。
#[derive(Debug, Clone)]
pub struct BroadcastAbortNotifier {
    tx: broadcast::Sender<AbortNotice>,
}

impl BroadcastAbortNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AbortNotice> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastAbortNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl AbortNotifier for BroadcastAbortNotifier {
    async fn notify(&self, notice: AbortNotice) {
        tracing::debug!(task_id = %notice.task_id, agent_id = %notice.agent_id, "broadcasting abort");
        // subscriber 不在は問題ない
        let _ = self.tx.send(notice);
    }
}
