//! SQLite task store (`sqlx`).
//!
//! Layout:
//! - `pipeline_runs` keyed by id.
//! - `tasks` keyed by id, indexed on `(status, created_at, id)` for candidate
//!   scans and on `(status, lease_expiry)` for the sweep.
//! - `task_dependencies (task_id, depends_on)`, indexed on `depends_on` for the
//!   dependents index.
//!
//! Ids are stored as bare ULID text, timestamps as unix milliseconds. The CAS
//! is one conditional `UPDATE` whose `WHERE` clause is the whole guard.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, SqlitePool};
use ulid::Ulid;

use super::batch::{self, Known};
use crate::domain::ids::{Id, IdMarker};
use crate::domain::{
    AgentId, HeddleError, PipelineRun, Preset, PresetParams, Result, RunId, RunStatus, Task,
    TaskGuard, TaskId, TaskSpec, TaskStatus, TaskUpdate,
};
use crate::ports::{Clock, IdGenerator, ReadyFilter, TaskStore, UlidGenerator};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id TEXT PRIMARY KEY NOT NULL,
    preset TEXT NOT NULL,
    params TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('active', 'completed', 'failed', 'cancelled')),
    note TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    run_id TEXT NOT NULL REFERENCES pipeline_runs(id),
    stage TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN
        ('pending', 'ready', 'claimed', 'running', 'done', 'failed', 'cancelled')),
    owner_id TEXT,
    lease_expiry INTEGER,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    payload TEXT NOT NULL,
    result TEXT,
    last_error TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    CHECK ((owner_id IS NULL) = (lease_expiry IS NULL)),
    CHECK (cancel_requested = 0 OR owner_id IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_tasks_candidates ON tasks(status, created_at, id);
CREATE INDEX IF NOT EXISTS idx_tasks_leases ON tasks(status, lease_expiry);
CREATE INDEX IF NOT EXISTS idx_tasks_run ON tasks(run_id, created_at, id);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id TEXT NOT NULL REFERENCES tasks(id),
    depends_on TEXT NOT NULL REFERENCES tasks(id),
    PRIMARY KEY (task_id, depends_on)
);

CREATE INDEX IF NOT EXISTS idx_task_dependencies_depends_on ON task_dependencies(depends_on);
";

const TASK_COLUMNS: &str = "id, run_id, stage, status, owner_id, lease_expiry, attempt_count, \
     max_attempts, payload, result, last_error, cancel_requested, created_at, updated_at";

/// Bound parameters per `IN (...)` list.
const IN_CHUNK: usize = 500;

pub struct SqliteTaskStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
}

impl SqliteTaskStore {
    /// Open (creating if needed) a database file.
    pub async fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, clock).await
    }

    /// Private in-memory database, for tests.
    ///
    /// A single connection that never idles out: every connection to
    /// `:memory:` would otherwise be a different database.
    pub async fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, clock).await
    }

    async fn with_pool(pool: SqlitePool, clock: Arc<dyn Clock>) -> Result<Self> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
        })
    }
}

// ========================================
// Row mapping
// ========================================

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| HeddleError::Storage(format!("timestamp out of range: {ms}")))
}

fn parse_id<T: IdMarker>(raw: &str) -> Result<Id<T>> {
    Ulid::from_string(raw)
        .map(Id::from_ulid)
        .map_err(|e| HeddleError::Storage(format!("invalid id '{raw}' in database: {e}")))
}

fn id_text<T: IdMarker>(id: Id<T>) -> String {
    id.as_ulid().to_string()
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| HeddleError::Storage(format!("failed to read {name}: {e}")))
}

fn count(value: i64, name: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| HeddleError::Storage(format!("{name} out of range: {value}")))
}

fn parse_task_row(row: &SqliteRow) -> Result<Task> {
    let status: String = column(row, "status")?;
    let status =
        TaskStatus::from_str(&status).map_err(|e| HeddleError::Storage(e.to_string()))?;
    let lease_expiry: Option<i64> = column(row, "lease_expiry")?;
    let payload: String = column(row, "payload")?;
    let result: Option<String> = column(row, "result")?;

    Ok(Task {
        id: parse_id(&column::<String>(row, "id")?)?,
        run_id: parse_id(&column::<String>(row, "run_id")?)?,
        stage: column(row, "stage")?,
        status,
        owner_id: column::<Option<String>>(row, "owner_id")?.map(AgentId::new),
        lease_expiry: lease_expiry.map(from_millis).transpose()?,
        attempt_count: count(column(row, "attempt_count")?, "attempt_count")?,
        max_attempts: count(column(row, "max_attempts")?, "max_attempts")?,
        depends_on: Default::default(),
        payload: serde_json::from_str(&payload)?,
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        last_error: column(row, "last_error")?,
        cancel_requested: column(row, "cancel_requested")?,
        created_at: from_millis(column(row, "created_at")?)?,
        updated_at: from_millis(column(row, "updated_at")?)?,
    })
}

fn parse_run_row(row: &SqliteRow) -> Result<PipelineRun> {
    let preset: String = column(row, "preset")?;
    let params: String = column(row, "params")?;
    let status: String = column(row, "status")?;

    Ok(PipelineRun {
        id: parse_id(&column::<String>(row, "id")?)?,
        preset: Preset::from_str(&preset)
            .map_err(|e| HeddleError::Storage(format!("stored run: {e}")))?,
        params: serde_json::from_str(&params)?,
        status: RunStatus::from_str(&status).map_err(|e| HeddleError::Storage(e.to_string()))?,
        note: column(row, "note")?,
        created_at: from_millis(column(row, "created_at")?)?,
        updated_at: from_millis(column(row, "updated_at")?)?,
    })
}

// ========================================
// Queries (all on one connection)
// ========================================

/// Fill `depends_on` for a set of tasks.
async fn load_dependencies(conn: &mut SqliteConnection, tasks: &mut [Task]) -> Result<()> {
    if tasks.is_empty() {
        return Ok(());
    }
    let mut edges: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    let ids: Vec<String> = tasks.iter().map(|t| id_text(t.id)).collect();

    for chunk in ids.chunks(IN_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT task_id, depends_on FROM task_dependencies WHERE task_id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id);
        }
        for row in query.fetch_all(&mut *conn).await? {
            let task_id: TaskId = parse_id(&column::<String>(&row, "task_id")?)?;
            let dep: TaskId = parse_id(&column::<String>(&row, "depends_on")?)?;
            edges.entry(task_id).or_default().push(dep);
        }
    }

    for task in tasks.iter_mut() {
        if let Some(deps) = edges.remove(&task.id) {
            task.depends_on = deps.into_iter().collect();
        }
    }
    Ok(())
}

async fn fetch_tasks<'q>(
    conn: &mut SqliteConnection,
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
) -> Result<Vec<Task>> {
    let rows = query.fetch_all(&mut *conn).await?;
    let mut tasks = rows.iter().map(parse_task_row).collect::<Result<Vec<_>>>()?;
    load_dependencies(conn, &mut tasks).await?;
    Ok(tasks)
}

async fn fetch_task(conn: &mut SqliteConnection, task_id: TaskId) -> Result<Option<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
    let tasks = fetch_tasks(conn, sqlx::query(&sql).bind(id_text(task_id))).await?;
    Ok(tasks.into_iter().next())
}

async fn fetch_run(conn: &mut SqliteConnection, run_id: RunId) -> Result<Option<PipelineRun>> {
    let row = sqlx::query(
        "SELECT id, preset, params, status, note, created_at, updated_at
         FROM pipeline_runs WHERE id = ?",
    )
    .bind(id_text(run_id))
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(parse_run_row).transpose()
}

async fn insert_tasks(
    conn: &mut SqliteConnection,
    run_id: RunId,
    specs: Vec<TaskSpec>,
    now: DateTime<Utc>,
) -> Result<Vec<Task>> {
    // Writing first takes the database write lock for the whole transaction,
    // so the reads below never need to upgrade a shared lock.
    let touched = sqlx::query("UPDATE pipeline_runs SET updated_at = updated_at WHERE id = ?")
        .bind(id_text(run_id))
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if touched == 0 {
        return Err(HeddleError::RunNotFound(run_id));
    }
    let run = fetch_run(conn, run_id)
        .await?
        .ok_or(HeddleError::RunNotFound(run_id))?;
    if run.status.is_terminal() {
        return Err(HeddleError::InvalidPipeline(format!(
            "{run_id} is already {}",
            run.status
        )));
    }

    let mut known = HashMap::new();
    let referenced: Vec<String> = batch::referenced_ids(&specs)
        .into_iter()
        .map(id_text)
        .collect();
    for chunk in referenced.chunks(IN_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("SELECT id, run_id, status FROM tasks WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id);
        }
        for row in query.fetch_all(&mut *conn).await? {
            let id: TaskId = parse_id(&column::<String>(&row, "id")?)?;
            let status: String = column(&row, "status")?;
            known.insert(
                id,
                Known {
                    run_id: parse_id(&column::<String>(&row, "run_id")?)?,
                    status: TaskStatus::from_str(&status)
                        .map_err(|e| HeddleError::Storage(e.to_string()))?,
                },
            );
        }
    }

    let tasks = batch::materialize(run_id, specs, &known, now)?;

    for task in &tasks {
        sqlx::query(
            "INSERT INTO tasks (id, run_id, stage, status, owner_id, lease_expiry, attempt_count,
                max_attempts, payload, result, last_error, created_at, updated_at)
             VALUES (?, ?, ?, ?, NULL, NULL, ?, ?, ?, NULL, NULL, ?, ?)",
        )
        .bind(id_text(task.id))
        .bind(id_text(run_id))
        .bind(&task.stage)
        .bind(task.status.as_str())
        .bind(i64::from(task.attempt_count))
        .bind(i64::from(task.max_attempts))
        .bind(serde_json::to_string(&task.payload)?)
        .bind(millis(task.created_at))
        .bind(millis(task.updated_at))
        .execute(&mut *conn)
        .await?;
    }
    // Edges after all rows exist, so in-batch references satisfy the foreign key.
    for task in &tasks {
        for dep in &task.depends_on {
            sqlx::query("INSERT INTO task_dependencies (task_id, depends_on) VALUES (?, ?)")
                .bind(id_text(task.id))
                .bind(id_text(*dep))
                .execute(&mut *conn)
                .await?;
        }
    }

    // Re-read so callers get exactly what is stored (millisecond timestamps).
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE run_id = ? AND created_at = ?");
    let stored = fetch_tasks(
        conn,
        sqlx::query(&sql).bind(id_text(run_id)).bind(millis(now)),
    )
    .await?;
    let mut by_id: HashMap<TaskId, Task> = stored.into_iter().map(|t| (t.id, t)).collect();
    tasks
        .iter()
        .map(|task| {
            by_id
                .remove(&task.id)
                .ok_or_else(|| HeddleError::Storage(format!("{} vanished after insert", task.id)))
        })
        .collect()
}

async fn swap(
    conn: &mut SqliteConnection,
    task_id: TaskId,
    expected: &TaskGuard,
    update: TaskUpdate,
    now: DateTime<Utc>,
) -> Result<Task> {
    let outcome = if expected.status.is_terminal() {
        0
    } else {
        let result = update.result.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "UPDATE tasks
             SET status = ?, owner_id = ?, lease_expiry = ?, attempt_count = ?,
                 result = COALESCE(?, result), last_error = COALESCE(?, last_error),
                 cancel_requested = ?, updated_at = ?
             WHERE id = ? AND status = ? AND owner_id IS ? AND lease_expiry IS ?
               AND attempt_count = ? AND cancel_requested = ?",
        )
        .bind(update.status.as_str())
        .bind(update.owner_id.as_ref().map(AgentId::as_str))
        .bind(update.lease_expiry.map(millis))
        .bind(i64::from(update.attempt_count))
        .bind(result)
        .bind(update.last_error.as_deref())
        .bind(update.cancel_requested)
        .bind(millis(now))
        .bind(id_text(task_id))
        .bind(expected.status.as_str())
        .bind(expected.owner_id.as_ref().map(AgentId::as_str))
        .bind(expected.lease_expiry.map(millis))
        .bind(i64::from(expected.attempt_count))
        .bind(expected.cancel_requested)
        .execute(&mut *conn)
        .await?
        .rows_affected()
    };

    match fetch_task(conn, task_id).await? {
        None => Err(HeddleError::TaskNotFound(task_id)),
        Some(_) if outcome == 0 => Err(HeddleError::Conflict { task_id }),
        Some(task) => Ok(task),
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_run(&self, preset: Preset, params: PresetParams) -> Result<RunId> {
        let id = self.ids.generate_run_id();
        let now = millis(self.clock.now());
        sqlx::query(
            "INSERT INTO pipeline_runs (id, preset, params, status, note, created_at, updated_at)
             VALUES (?, ?, ?, ?, NULL, ?, ?)",
        )
        .bind(id_text(id))
        .bind(preset.as_str())
        .bind(serde_json::to_string(&params)?)
        .bind(RunStatus::Active.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn create_tasks(&self, run_id: RunId, specs: Vec<TaskSpec>) -> Result<Vec<Task>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let tasks = insert_tasks(&mut tx, run_id, specs, now).await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let task = swap(&mut tx, task_id, expected, update, now).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn read(&self, task_id: TaskId) -> Result<Task> {
        let mut conn = self.pool.acquire().await?;
        fetch_task(&mut conn, task_id)
            .await?
            .ok_or(HeddleError::TaskNotFound(task_id))
    }

    async fn scan_ready(&self, filter: &ReadyFilter, limit: usize) -> Result<Vec<Task>> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'ready'");
        if filter.run_id.is_some() {
            sql.push_str(" AND run_id = ?");
        }
        if filter.stage.is_some() {
            sql.push_str(" AND stage = ?");
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(run_id) = filter.run_id {
            query = query.bind(id_text(run_id));
        }
        if let Some(stage) = &filter.stage {
            query = query.bind(stage.as_str());
        }
        query = query.bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let mut conn = self.pool.acquire().await?;
        fetch_tasks(&mut conn, query).await
    }

    async fn scan_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status IN ('claimed', 'running') AND lease_expiry <= ?
             ORDER BY lease_expiry ASC, id ASC LIMIT ?"
        );
        let query = sqlx::query(&sql)
            .bind(millis(now))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX));
        let mut conn = self.pool.acquire().await?;
        fetch_tasks(&mut conn, query).await
    }

    async fn dependents_of(&self, task_id: TaskId) -> Result<Vec<Task>> {
        let mut conn = self.pool.acquire().await?;
        if fetch_task(&mut conn, task_id).await?.is_none() {
            return Err(HeddleError::TaskNotFound(task_id));
        }
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE id IN (SELECT task_id FROM task_dependencies WHERE depends_on = ?)
             ORDER BY created_at ASC, id ASC"
        );
        fetch_tasks(&mut conn, sqlx::query(&sql).bind(id_text(task_id))).await
    }

    async fn run_tasks(&self, run_id: RunId) -> Result<Vec<Task>> {
        let mut conn = self.pool.acquire().await?;
        if fetch_run(&mut conn, run_id).await?.is_none() {
            return Err(HeddleError::RunNotFound(run_id));
        }
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE run_id = ? ORDER BY created_at ASC, id ASC"
        );
        fetch_tasks(&mut conn, sqlx::query(&sql).bind(id_text(run_id))).await
    }

    async fn read_run(&self, run_id: RunId) -> Result<PipelineRun> {
        let mut conn = self.pool.acquire().await?;
        fetch_run(&mut conn, run_id)
            .await?
            .ok_or(HeddleError::RunNotFound(run_id))
    }

    async fn update_run_status(
        &self,
        run_id: RunId,
        expected: RunStatus,
        new: RunStatus,
        note: Option<String>,
    ) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE pipeline_runs SET status = ?, note = COALESCE(?, note), updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(new.as_str())
        .bind(note)
        .bind(millis(self.clock.now()))
        .bind(id_text(run_id))
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            // Distinguish "moved on" from "never existed".
            self.read_run(run_id).await?;
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone};

    async fn store() -> (SqliteTaskStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = SqliteTaskStore::in_memory(clock.clone()).await.unwrap();
        (store, clock)
    }

    fn spec(id: TaskId, deps: &[TaskId]) -> TaskSpec {
        TaskSpec {
            id,
            stage: "review".into(),
            depends_on: deps.iter().copied().collect(),
            payload: serde_json::json!({"n": 1}),
            max_attempts: 3,
        }
    }

    fn id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn tasks_round_trip_with_dependencies() {
        let (store, _) = store().await;
        let run = store
            .create_run(Preset::Review, PresetParams::default())
            .await
            .unwrap();
        let (a, b) = (id(), id());
        let created = store
            .create_tasks(run, vec![spec(a, &[]), spec(b, &[a])])
            .await
            .unwrap();
        assert_eq!(created[0].status, TaskStatus::Ready);
        assert_eq!(created[1].status, TaskStatus::Pending);

        let read = store.read(b).await.unwrap();
        assert_eq!(read, created[1]);
        assert!(read.depends_on.contains(&a));
        assert_eq!(read.payload, serde_json::json!({"n": 1}));

        let dependents = store.dependents_of(a).await.unwrap();
        assert_eq!(dependents.iter().map(|t| t.id).collect::<Vec<_>>(), vec![b]);
    }

    #[tokio::test]
    async fn rejected_batch_leaves_no_rows() {
        let (store, _) = store().await;
        let run = store
            .create_run(Preset::Review, PresetParams::default())
            .await
            .unwrap();
        let (a, b) = (id(), id());
        let err = store
            .create_tasks(run, vec![spec(a, &[b]), spec(b, &[a])])
            .await
            .unwrap_err();
        assert!(matches!(err, HeddleError::InvalidPipeline(_)));
        assert!(store.run_tasks(run).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cas_guard_covers_owner_lease_and_attempts() {
        let (store, clock) = store().await;
        let run = store
            .create_run(Preset::Review, PresetParams::default())
            .await
            .unwrap();
        let a = id();
        let task = store.create_tasks(run, vec![spec(a, &[])]).await.unwrap()[0].clone();
        let lease = clock.now() + Duration::seconds(30);

        let claimed = store
            .compare_and_swap(a, &task.guard(), TaskUpdate::claim(&task, AgentId::from("x"), lease))
            .await
            .unwrap();
        assert_eq!(claimed.owner_id, Some(AgentId::from("x")));
        assert_eq!(claimed.lease_expiry, Some(lease));

        let stale = store
            .compare_and_swap(a, &task.guard(), TaskUpdate::claim(&task, AgentId::from("y"), lease))
            .await
            .unwrap_err();
        assert!(matches!(stale, HeddleError::Conflict { .. }));

        let requeued = store
            .compare_and_swap(
                a,
                &claimed.guard(),
                TaskUpdate::release(TaskStatus::Ready, 1).with_error("lost"),
            )
            .await
            .unwrap();
        assert_eq!(requeued.owner_id, None);
        assert_eq!(requeued.last_error.as_deref(), Some("lost"));

        let missing = store
            .compare_and_swap(id(), &requeued.guard(), TaskUpdate::release(TaskStatus::Ready, 1))
            .await
            .unwrap_err();
        assert!(matches!(missing, HeddleError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn scans_follow_indexes() {
        let (store, clock) = store().await;
        let run = store
            .create_run(Preset::Review, PresetParams::default())
            .await
            .unwrap();
        let (a, b) = (id(), id());
        let first = store.create_tasks(run, vec![spec(a, &[])]).await.unwrap()[0].clone();
        clock.advance(Duration::milliseconds(10));
        store.create_tasks(run, vec![spec(b, &[])]).await.unwrap();

        let ready = store.scan_ready(&ReadyFilter::run(run), 10).await.unwrap();
        assert_eq!(ready.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a, b]);

        let lease = clock.now() + Duration::seconds(1);
        store
            .compare_and_swap(a, &first.guard(), TaskUpdate::claim(&first, AgentId::from("x"), lease))
            .await
            .unwrap();
        assert!(store.scan_expired(clock.now(), 10).await.unwrap().is_empty());
        clock.advance(Duration::seconds(1));
        let expired = store.scan_expired(clock.now(), 10).await.unwrap();
        assert_eq!(expired.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a]);
    }

    #[tokio::test]
    async fn run_status_cas_and_params_survive() {
        let (store, _) = store().await;
        let params = PresetParams {
            width: Some(4),
            ..PresetParams::default()
        };
        let run = store.create_run(Preset::Security, params.clone()).await.unwrap();

        assert!(
            store
                .update_run_status(run, RunStatus::Active, RunStatus::Failed, Some("boom".into()))
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
        assert_eq!(stored.preset, Preset::Security);
        assert_eq!(stored.params, params);
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.note.as_deref(), Some("boom"));

        let unknown = RunId::from_ulid(Ulid::new());
        assert!(matches!(
            store.read_run(unknown).await,
            Err(HeddleError::RunNotFound(_))
        ));
    }
}
