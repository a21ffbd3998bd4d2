#![allow(dead_code)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use heddle_core::domain::{AgentId, Task, TaskId, TaskStatus};
use heddle_core::impls::{BroadcastAbortNotifier, SqliteTaskStore};
use heddle_core::ports::{Clock, FixedClock, TaskStore};
use heddle_core::{Coordinator, CoordinatorBuilder, HeddleConfig};
use tempfile::TempDir;

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    SqliteFile,
}

pub struct Harness {
    pub coordinator: Arc<Coordinator>,
    pub clock: Arc<FixedClock>,
    pub notifier: BroadcastAbortNotifier,
    _dir: Option<TempDir>,
}

impl Harness {
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        self.coordinator.store()
    }

    pub async fn read(&self, id: TaskId) -> Task {
        self.store().read(id).await.unwrap()
    }

    pub async fn status_of(&self, id: TaskId) -> TaskStatus {
        self.read(id).await.status
    }
}

/// Lease of 30s, K = 8, three attempts by default.
pub async fn harness(backend: Backend) -> Harness {
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
    ));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let notifier = BroadcastAbortNotifier::default();

    let mut builder = CoordinatorBuilder::new()
        .config(HeddleConfig::default())
        .clock(dyn_clock.clone())
        .notifier(Arc::new(notifier.clone()));
    let mut dir = None;
    if let Backend::SqliteFile = backend {
        let tmp = tempfile::tempdir().unwrap();
        let store = SqliteTaskStore::open(&tmp.path().join("heddle.db"), dyn_clock)
            .await
            .unwrap();
        builder = builder.store(Arc::new(store));
        dir = Some(tmp);
    }

    Harness {
        coordinator: Arc::new(builder.build().unwrap()),
        clock,
        notifier,
        _dir: dir,
    }
}

pub fn agent(name: &str) -> AgentId {
    AgentId::from(name)
}
