//! InMemory TaskStore
//!
//! 状態全体を 1 つの `tokio::sync::Mutex` で包む。trait の各呼び出しは単一の
//! クリティカルセクションなので、アトミックかつ線形化可能。
//! ロック保持中に await はしない。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::batch::{self, Known};
use crate::domain::{
    HeddleError, PipelineRun, Preset, PresetParams, Result, RunId, RunStatus, Task, TaskGuard,
    TaskId, TaskSpec, TaskStatus, TaskUpdate,
};
use crate::ports::{Clock, IdGenerator, ReadyFilter, TaskStore, UlidGenerator};

/// 候補の並び順キー
type ReadyKey = (DateTime<Utc>, TaskId);

#[derive(Default)]
struct StoreState {
    runs: HashMap<RunId, PipelineRun>,

    /// 全タスクレコード（タスクの正本）
    tasks: HashMap<TaskId, Task>,

    /// 逆依存インデックス: task -> それを待つタスク
    dependents: HashMap<TaskId, BTreeSet<TaskId>>,

    /// run ごとのタスク ID
    by_run: HashMap<RunId, BTreeSet<TaskId>>,

    /// 候補順の ready タスク
    ready: BTreeSet<ReadyKey>,

    /// lease 期限順の所有中タスク
    leased: BTreeSet<ReadyKey>,
}

impl StoreState {
    fn unindex(&mut self, task: &Task) {
        match task.status {
            TaskStatus::Ready => {
                self.ready.remove(&(task.created_at, task.id));
            }
            TaskStatus::Claimed | TaskStatus::Running => {
                if let Some(expiry) = task.lease_expiry {
                    self.leased.remove(&(expiry, task.id));
                }
            }
            _ => {}
        }
    }

    fn index(&mut self, task: &Task) {
        match task.status {
            TaskStatus::Ready => {
                self.ready.insert((task.created_at, task.id));
            }
            TaskStatus::Claimed | TaskStatus::Running => {
                if let Some(expiry) = task.lease_expiry {
                    self.leased.insert((expiry, task.id));
                }
            }
            _ => {}
        }
    }

    fn sorted(&self, ids: impl IntoIterator<Item = TaskId>) -> Vec<Task> {
        let mut tasks: Vec<Task> = ids
            .into_iter()
            .filter_map(|id| self.tasks.get(&id).cloned())
            .collect();
        tasks.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        tasks
    }
}

/// プロセスメモリ上の `TaskStore`
///
/// テスト・デモ・単一 coordinator プロセス向け。再起動で何も残らない。
#[derive(Clone)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
    ids: Arc<UlidGenerator<Arc<dyn Clock>>>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_run(&self, preset: Preset, params: PresetParams) -> Result<RunId> {
        let id = self.ids.generate_run_id();
        let run = PipelineRun::new(id, preset, params, self.clock.now());

        let mut state = self.state.lock().await;
        state.runs.insert(id, run);
        state.by_run.entry(id).or_default();
        Ok(id)
    }

    async fn create_tasks(&self, run_id: RunId, specs: Vec<TaskSpec>) -> Result<Vec<Task>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let run = state
            .runs
            .get(&run_id)
            .ok_or(HeddleError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(HeddleError::InvalidPipeline(format!(
                "{run_id} is already {}",
                run.status
            )));
        }

        let known: HashMap<TaskId, Known> = batch::referenced_ids(&specs)
            .into_iter()
            .filter_map(|id| {
                state.tasks.get(&id).map(|task| {
                    (
                        id,
                        Known {
                            run_id: task.run_id,
                            status: task.status,
                        },
                    )
                })
            })
            .collect();

        // 最初の書き込み前に検証する
        let tasks = batch::materialize(run_id, specs, &known, now)?;

        for task in &tasks {
            for &dep in &task.depends_on {
                state.dependents.entry(dep).or_default().insert(task.id);
            }
            state.by_run.entry(run_id).or_default().insert(task.id);
            state.index(task);
            state.tasks.insert(task.id, task.clone());
        }
        Ok(tasks)
    }

    async fn compare_and_swap(
        &self,
        task_id: TaskId,
        expected: &TaskGuard,
        update: TaskUpdate,
    ) -> Result<Task> {
        if !update.is_consistent() {
            return Err(HeddleError::Storage(format!(
                "refusing inconsistent update for {task_id}: {update:?}"
            )));
        }
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let current = state
            .tasks
            .get(&task_id)
            .ok_or(HeddleError::TaskNotFound(task_id))?;
        if expected.status.is_terminal() || current.guard() != *expected {
            return Err(HeddleError::Conflict { task_id });
        }

        let mut task = current.clone();
        state.unindex(&task);
        task.apply(update, now);
        state.index(&task);
        state.tasks.insert(task_id, task.clone());
        Ok(task)
    }

    async fn read(&self, task_id: TaskId) -> Result<Task> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(HeddleError::TaskNotFound(task_id))
    }

    async fn scan_ready(&self, filter: &ReadyFilter, limit: usize) -> Result<Vec<Task>> {
        let state = self.state.lock().await;
        Ok(state
            .ready
            .iter()
            .filter_map(|(_, id)| state.tasks.get(id))
            .filter(|task| filter.matches(task))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn scan_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let state = self.state.lock().await;
        Ok(state
            .leased
            .iter()
            .take_while(|(expiry, _)| *expiry <= now)
            .filter_map(|(_, id)| state.tasks.get(id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn dependents_of(&self, task_id: TaskId) -> Result<Vec<Task>> {
        let state = self.state.lock().await;
        if !state.tasks.contains_key(&task_id) {
            return Err(HeddleError::TaskNotFound(task_id));
        }
        let ids = state
            .dependents
            .get(&task_id)
            .map(|ids| ids.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(state.sorted(ids))
    }

    async fn run_tasks(&self, run_id: RunId) -> Result<Vec<Task>> {
        let state = self.state.lock().await;
        let ids = state
            .by_run
            .get(&run_id)
            .ok_or(HeddleError::RunNotFound(run_id))?
            .iter()
            .copied()
            .collect::<Vec<_>>();
        Ok(state.sorted(ids))
    }

    async fn read_run(&self, run_id: RunId) -> Result<PipelineRun> {
        let state = self.state.lock().await;
        state
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(HeddleError::RunNotFound(run_id))
    }

    async fn update_run_status(
        &self,
        run_id: RunId,
        expected: RunStatus,
        new: RunStatus,
        note: Option<String>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(HeddleError::RunNotFound(run_id))?;
        if run.status != expected {
            return Ok(false);
        }
        run.status = new;
        if note.is_some() {
            run.note = note;
        }
        run.updated_at = now;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AgentId;
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn store() -> (InMemoryTaskStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        (InMemoryTaskStore::new(clock.clone()), clock)
    }

    fn spec(id: TaskId, stage: &str, deps: &[TaskId]) -> TaskSpec {
        TaskSpec {
            id,
            stage: stage.into(),
            depends_on: deps.iter().copied().collect(),
            payload: serde_json::json!({}),
            max_attempts: 2,
        }
    }

    fn id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn create_and_scan_in_candidate_order() {
        let (store, clock) = store();
        let run = store
            .create_run(Preset::Review, PresetParams::default())
            .await
            .unwrap();

        let (a, b) = (id(), id());
        store.create_tasks(run, vec![spec(a, "scope", &[])]).await.unwrap();
        clock.advance(Duration::seconds(1));
        store.create_tasks(run, vec![spec(b, "scope", &[])]).await.unwrap();

        let ready = store.scan_ready(&ReadyFilter::run(run), 10).await.unwrap();
        assert_eq!(ready.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a, b]);

        let limited = store.scan_ready(&ReadyFilter::any(), 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, a);

        let other_stage = store
            .scan_ready(&ReadyFilter::run(run).with_stage("review"), 10)
            .await
            .unwrap();
        assert!(other_stage.is_empty());
    }

    #[tokio::test]
    async fn invalid_batch_writes_nothing() {
        let (store, _) = store();
        let run = store
            .create_run(Preset::Review, PresetParams::default())
            .await
            .unwrap();

        let (a, b) = (id(), id());
        let err = store
            .create_tasks(run, vec![spec(a, "s", &[]), spec(b, "s", &[id()])])
            .await
            .unwrap_err();
        assert!(matches!(err, HeddleError::InvalidPipeline(_)));
        assert!(store.run_tasks(run).await.unwrap().is_empty());
        assert!(matches!(
            store.read(a).await,
            Err(HeddleError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cas_applies_only_on_exact_guard() {
        let (store, clock) = store();
        let run = store
            .create_run(Preset::Review, PresetParams::default())
            .await
            .unwrap();
        let a = id();
        let task = store.create_tasks(run, vec![spec(a, "s", &[])]).await.unwrap()[0].clone();
        let lease = clock.now() + Duration::seconds(30);

        let claimed = store
            .compare_and_swap(a, &task.guard(), TaskUpdate::claim(&task, AgentId::from("x"), lease))
            .await
            .unwrap();
        assert_eq!(claimed.status, TaskStatus::Claimed);

        // Same stale guard again: the record moved on.
        let err = store
            .compare_and_swap(a, &task.guard(), TaskUpdate::claim(&task, AgentId::from("y"), lease))
            .await
            .unwrap_err();
        assert!(matches!(err, HeddleError::Conflict { .. }));
        assert_eq!(store.read(a).await.unwrap().owner_id, Some(AgentId::from("x")));
        assert!(store.scan_ready(&ReadyFilter::any(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_tasks_are_never_mutated() {
        let (store, _) = store();
        let run = store
            .create_run(Preset::Review, PresetParams::default())
            .await
            .unwrap();
        let a = id();
        let task = store.create_tasks(run, vec![spec(a, "s", &[])]).await.unwrap()[0].clone();
        let cancelled = store
            .compare_and_swap(a, &task.guard(), TaskUpdate::status_only(&task, TaskStatus::Cancelled))
            .await
            .unwrap();

        let err = store
            .compare_and_swap(
                a,
                &cancelled.guard(),
                TaskUpdate::status_only(&cancelled, TaskStatus::Ready),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HeddleError::Conflict { .. }));
    }

    #[tokio::test]
    async fn expired_leases_are_scanned_inclusively() {
        let (store, clock) = store();
        let run = store
            .create_run(Preset::Review, PresetParams::default())
            .await
            .unwrap();
        let a = id();
        let task = store.create_tasks(run, vec![spec(a, "s", &[])]).await.unwrap()[0].clone();
        let lease = clock.now() + Duration::seconds(5);
        store
            .compare_and_swap(a, &task.guard(), TaskUpdate::claim(&task, AgentId::from("x"), lease))
            .await
            .unwrap();

        assert!(store.scan_expired(clock.now(), 10).await.unwrap().is_empty());
        clock.set(lease);
        let expired = store.scan_expired(clock.now(), 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, a);
    }

    #[tokio::test]
    async fn dependents_index_and_run_status_cas() {
        let (store, _) = store();
        let run = store
            .create_run(Preset::Review, PresetParams::default())
            .await
            .unwrap();
        let (a, b, c) = (id(), id(), id());
        store
            .create_tasks(
                run,
                vec![spec(a, "s", &[]), spec(b, "t", &[a]), spec(c, "t", &[a])],
            )
            .await
            .unwrap();

        let dependents = store.dependents_of(a).await.unwrap();
        assert_eq!(dependents.len(), 2);
        assert!(dependents.iter().all(|t| t.status == TaskStatus::Pending));

        assert!(
            store
                .update_run_status(run, RunStatus::Active, RunStatus::Cancelled, Some("stop".into()))
                .await
                .unwrap()
        );
        assert!(
            !store
                .update_run_status(run, RunStatus::Active, RunStatus::Completed, None)
                .await
                .unwrap()
        );
        let stored = store.read_run(run).await.unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert_eq!(stored.note.as_deref(), Some("stop"));
    }
}
