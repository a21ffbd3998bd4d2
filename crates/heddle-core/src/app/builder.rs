//! CoordinatorBuilder - 配線と起動時検証
//!
//! # Fail-fast
//! `build()` は配線前に設定を検証する。lease や再試行の不正な設定は
//! 最初の claim ではなく起動時に報告される。

use std::sync::Arc;

use crate::app::cancel::CancellationCoordinator;
use crate::app::claim::ClaimManager;
use crate::app::coordinator::Coordinator;
use crate::app::graph::DependencyGraph;
use crate::app::lease_monitor::LeaseMonitor;
use crate::app::status::RunStatusTracker;
use crate::config::{HeddleConfig, StoreKind};
use crate::domain::{HeddleError, Result};
use crate::impls::{InMemoryTaskStore, SqliteTaskStore, TracingAbortNotifier};
use crate::ports::{AbortNotifier, Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};

/// ```ignore
/// let coordinator = CoordinatorBuilder::new()
///     .config(config)
///     .store(store)
///     .notifier(notifier)
///     .build()?;
/// ```
///
/// 未指定のものはデフォルトを使う：
/// - SystemClock
/// - InMemoryTaskStore
/// - ULID 採番、abort 通知はログ出力
pub struct CoordinatorBuilder {
    config: HeddleConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn TaskStore>>,
    ids: Option<Arc<dyn IdGenerator>>,
    notifier: Option<Arc<dyn AbortNotifier>>,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            config: HeddleConfig::default(),
            clock: None,
            store: None,
            ids: None,
            notifier: None,
        }
    }

    pub fn config(mut self, config: HeddleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn AbortNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// 設定の `[store]` が指すストアを開いて build する
    ///
    /// 明示的に指定されたストアが設定より優先される。
    pub async fn open(mut self) -> Result<Coordinator> {
        self.config.validate()?;
        if self.store.is_none() && self.config.store.kind == StoreKind::Sqlite {
            let clock = self.resolved_clock();
            let store = SqliteTaskStore::open(&self.config.store.path, clock).await?;
            tracing::info!(path = %self.config.store.path.display(), "sqlite store opened");
            self.store = Some(Arc::new(store));
        }
        self.build()
    }

    /// コンポーネントを配線する
    ///
    /// # Errors
    /// 設定が不正な場合、または sqlite ストアが設定されているのに渡されていない
    /// 場合（[`Self::open`] を使う）は `HeddleError::Config`。
    pub fn build(self) -> Result<Coordinator> {
        self.config.validate()?;
        let clock = self.resolved_clock();

        let store: Arc<dyn TaskStore> = match (self.store, self.config.store.kind) {
            (Some(store), _) => store,
            (None, StoreKind::Memory) => Arc::new(InMemoryTaskStore::new(clock.clone())),
            (None, StoreKind::Sqlite) => {
                return Err(HeddleError::Config(
                    "sqlite store must be opened before build(); use open()".into(),
                ));
            }
        };
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingAbortNotifier));

        let lease = chrono::Duration::milliseconds(
            i64::try_from(self.config.lease.duration_ms)
                .map_err(|_| HeddleError::Config("[lease].duration_ms is too large".into()))?,
        );

        let status = RunStatusTracker::new(store.clone());
        let graph = Arc::new(DependencyGraph::new(
            store.clone(),
            ids,
            self.config.tasks.max_attempts,
        ));
        let cancel = Arc::new(CancellationCoordinator::new(
            store.clone(),
            notifier,
            status.clone(),
        ));
        let claims = Arc::new(ClaimManager::new(
            store.clone(),
            clock.clone(),
            graph.clone(),
            cancel.clone(),
            lease,
            self.config.claim.max_candidates,
        ));
        let monitor = Arc::new(LeaseMonitor::new(
            store.clone(),
            clock,
            claims.clone(),
            self.config.lease.sweep_batch,
        ));

        Ok(Coordinator {
            store,
            graph,
            claims,
            cancel,
            status,
            monitor,
            config: self.config,
        })
    }

    fn resolved_clock(&self) -> Arc<dyn Clock> {
        self.clock.clone().unwrap_or_else(|| Arc::new(SystemClock))
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeaseConfig;
    use crate::domain::{AgentId, Preset, PresetParams, RunStatus, TaskStatus};
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    #[test]
    fn invalid_config_fails_fast() {
        let config = HeddleConfig {
            lease: LeaseConfig {
                duration_ms: 0,
                ..LeaseConfig::default()
            },
            ..HeddleConfig::default()
        };
        let built = CoordinatorBuilder::new().config(config).build();
        assert!(matches!(built, Err(HeddleError::Config(_))));
    }

    #[test]
    fn sqlite_config_needs_open() {
        let mut config = HeddleConfig::default();
        config.store.kind = StoreKind::Sqlite;
        let built = CoordinatorBuilder::new().config(config).build();
        assert!(matches!(built, Err(HeddleError::Config(_))));
    }

    #[tokio::test]
    async fn defaults_wire_an_in_memory_coordinator() {
        let coordinator = CoordinatorBuilder::default().build().unwrap();
        let run_id = coordinator
            .create_pipeline_run(Preset::Research, PresetParams::default())
            .await
            .unwrap();

        let agent = AgentId::from("solo");
        while let Some(task) = coordinator.claim_task(&agent, Some(run_id), None).await.unwrap() {
            coordinator.start_task(task.id, &agent).await.unwrap();
            coordinator
                .complete_task(task.id, &agent, serde_json::json!({"ok": true}))
                .await
                .unwrap();
        }

        let report = coordinator.get_run_status(run_id).await.unwrap();
        assert_eq!(report.run.status, RunStatus::Completed);
        assert!(report.tasks.iter().all(|t| t.status == TaskStatus::Done));
    }

    #[tokio::test]
    async fn injected_clock_drives_lease_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(now));
        let coordinator = CoordinatorBuilder::new().clock(clock).build().unwrap();
        let run_id = coordinator
            .create_pipeline_run(Preset::Debug, PresetParams::default())
            .await
            .unwrap();

        let task = coordinator
            .claim_task(&AgentId::from("solo"), Some(run_id), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.created_at, now);
        assert_eq!(task.lease_expiry, Some(now + coordinator.lease_duration()));
    }

    #[tokio::test]
    async fn open_uses_the_configured_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HeddleConfig::default();
        config.store.kind = StoreKind::Sqlite;
        config.store.path = dir.path().join("heddle.db");

        let coordinator = CoordinatorBuilder::new().config(config).open().await.unwrap();
        let run_id = coordinator
            .create_pipeline_run(Preset::Review, PresetParams::default())
            .await
            .unwrap();
        assert_eq!(coordinator.get_run_status(run_id).await.unwrap().tasks.len(), 4);
    }
}
