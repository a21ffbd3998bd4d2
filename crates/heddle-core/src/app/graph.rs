//! DependencyGraph - preset 展開と ready 伝播
//!
//! # 展開
//! preset テンプレートと params から `TaskSpec` のバッチを作る。各ステージの
//! タスクは直前に残ったステージの全タスクに依存するため、fan-out の次の
//! ステージは barrier join になる。バッチは run 作成前にトポロジカルソートで
//! 検査し、失敗すれば何も残らない。
//!
//! # Readiness
//! `on_task_done` はタスクを完了させた側が呼ぶ。依存先を読み直し、その依存が
//! すべて done のときだけ CAS で `pending -> ready` にする。兄弟タスクの同時完了
//! では、それぞれが自分の書き込み後に同じ検査を行う。最後の `done` を見た側が
//! join タスクを昇格させ、重複した昇格は CAS に負けるだけで害はない。

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;

use crate::domain::{
    DependencyIndex, HeddleError, Preset, PresetParams, Result, RunId, RunStatus, TaskId,
    TaskSpec, TaskStatus, TaskUpdate,
};
use crate::ports::{IdGenerator, TaskStore};

pub struct DependencyGraph {
    store: Arc<dyn TaskStore>,
    ids: Arc<dyn IdGenerator>,
    default_max_attempts: u32,
}

impl DependencyGraph {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ids: Arc<dyn IdGenerator>,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            store,
            ids,
            default_max_attempts,
        }
    }

    /// preset を依存辺付きの task spec に展開する
    pub fn expand(&self, preset: Preset, params: &PresetParams) -> Result<Vec<TaskSpec>> {
        let stages = params.resolve(preset)?;
        let max_attempts = params.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts == 0 {
            return Err(HeddleError::InvalidPipeline(
                "max_attempts must be at least 1".into(),
            ));
        }

        let mut specs = Vec::new();
        let mut previous: BTreeSet<TaskId> = BTreeSet::new();
        for stage in &stages {
            let mut current = BTreeSet::new();
            for index in 0..stage.width {
                let id = self.ids.generate_task_id();
                specs.push(TaskSpec {
                    id,
                    stage: stage.name.to_string(),
                    depends_on: previous.clone(),
                    payload: json!({
                        "preset": preset.as_str(),
                        "stage": stage.name,
                        "index": index,
                        "width": stage.width,
                        "context": params.context,
                    }),
                    max_attempts,
                });
                current.insert(id);
            }
            previous = current;
        }

        if let Some(stuck) = DependencyIndex::from_specs(&specs).detect_cycle() {
            return Err(HeddleError::InvalidPipeline(format!(
                "preset '{preset}' expanded into a cycle over {} task(s)",
                stuck.len()
            )));
        }
        Ok(specs)
    }

    /// run と全タスクを作成する
    ///
    /// params は run レコードを書く前に検証するので、不正な pipeline は痕跡を残さない。
    pub async fn create_run(&self, preset: Preset, params: PresetParams) -> Result<RunId> {
        let specs = self.expand(preset, &params)?;
        let task_count = specs.len();
        let run_id = self.store.create_run(preset, params).await?;

        if let Err(e) = self.store.create_tasks(run_id, specs).await {
            // バッチはアトミックに拒否された。空の run が active に見えないよう閉じる
            let note = format!("task creation failed: {e}");
            self.store
                .update_run_status(run_id, RunStatus::Active, RunStatus::Failed, Some(note))
                .await?;
            return Err(e);
        }

        tracing::info!(run_id = %run_id, preset = %preset, tasks = task_count, "pipeline run created");
        Ok(run_id)
    }

    /// `done` になったタスクの依存先を昇格させる
    ///
    /// この呼び出しで昇格させた ID を返す。冪等：再実行や兄弟タスクによる
    /// 同時実行でも二重に昇格しない。
    pub async fn on_task_done(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        let mut promoted = Vec::new();

        for dependent in self.store.dependents_of(task_id).await? {
            if dependent.status != TaskStatus::Pending {
                continue;
            }
            if !self.all_done(&dependent.depends_on).await? {
                continue;
            }

            let update = TaskUpdate::status_only(&dependent, TaskStatus::Ready);
            match self
                .store
                .compare_and_swap(dependent.id, &dependent.guard(), update)
                .await
            {
                Ok(_) => {
                    tracing::debug!(task_id = %dependent.id, after = %task_id, "task ready");
                    promoted.push(dependent.id);
                }
                // 兄弟タスクの完了で昇格済み、またはその間にキャンセルされた
                Err(HeddleError::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(promoted)
    }

    async fn all_done(&self, deps: &BTreeSet<TaskId>) -> Result<bool> {
        for &dep in deps {
            if self.store.read(dep).await?.status != TaskStatus::Done {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{SystemClock, UlidGenerator};
    use std::collections::BTreeMap;

    fn graph() -> (DependencyGraph, Arc<dyn TaskStore>) {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new(Arc::new(SystemClock)));
        let ids = Arc::new(UlidGenerator::new(SystemClock));
        (DependencyGraph::new(store.clone(), ids, 3), store)
    }

    #[test]
    fn review_with_skipped_report_matches_scenario_shape() {
        let (graph, _) = graph();
        let params = PresetParams {
            width: Some(2),
            skip: BTreeSet::from(["report".to_string()]),
            ..PresetParams::default()
        };

        let specs = graph.expand(Preset::Review, &params).unwrap();
        assert_eq!(specs.len(), 3);
        let a = &specs[0];
        assert!(a.depends_on.is_empty());
        for sibling in &specs[1..] {
            assert_eq!(sibling.depends_on, BTreeSet::from([a.id]));
            assert_eq!(sibling.stage, "review");
        }
    }

    #[test]
    fn join_stage_waits_for_every_sibling() {
        let (graph, _) = graph();
        let params = PresetParams {
            stage_widths: BTreeMap::from([("implement".to_string(), 4)]),
            ..PresetParams::default()
        };

        let specs = graph.expand(Preset::Implement, &params).unwrap();
        let implementers: BTreeSet<TaskId> = specs
            .iter()
            .filter(|s| s.stage == "implement")
            .map(|s| s.id)
            .collect();
        let integrate = specs.iter().find(|s| s.stage == "integrate").unwrap();

        assert_eq!(implementers.len(), 4);
        assert_eq!(integrate.depends_on, implementers);
    }

    #[test]
    fn payload_carries_stage_position_and_context() {
        let (graph, _) = graph();
        let params = PresetParams {
            context: json!({"repo": "heddle"}),
            max_attempts: Some(5),
            ..PresetParams::default()
        };

        let specs = graph.expand(Preset::Research, &params).unwrap();
        let second = &specs[2];
        assert_eq!(second.payload["stage"], "investigate");
        assert_eq!(second.payload["index"], 1);
        assert_eq!(second.payload["width"], 2);
        assert_eq!(second.payload["context"]["repo"], "heddle");
        assert!(specs.iter().all(|s| s.max_attempts == 5));
    }

    #[tokio::test]
    async fn invalid_params_create_nothing() {
        let (graph, store) = graph();
        let params = PresetParams {
            width: Some(0),
            ..PresetParams::default()
        };

        let err = graph.create_run(Preset::Debug, params).await.unwrap_err();
        assert!(matches!(err, HeddleError::InvalidPipeline(_)));
        assert!(
            store
                .scan_ready(&crate::ports::ReadyFilter::any(), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    async fn mark_done(store: &Arc<dyn TaskStore>, task_id: TaskId) {
        let current = store.read(task_id).await.unwrap();
        store
            .compare_and_swap(
                task_id,
                &current.guard(),
                TaskUpdate::status_only(&current, TaskStatus::Done),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn join_becomes_ready_only_after_last_sibling() {
        let (graph, store) = graph();
        let run = graph
            .create_run(Preset::Review, PresetParams::default())
            .await
            .unwrap();
        let tasks = store.run_tasks(run).await.unwrap();
        let reviews: Vec<TaskId> = tasks
            .iter()
            .filter(|t| t.stage == "review")
            .map(|t| t.id)
            .collect();
        let report = tasks.iter().find(|t| t.stage == "report").unwrap().id;

        mark_done(&store, reviews[0]).await;
        assert!(graph.on_task_done(reviews[0]).await.unwrap().is_empty());
        assert_eq!(store.read(report).await.unwrap().status, TaskStatus::Pending);

        mark_done(&store, reviews[1]).await;
        assert_eq!(graph.on_task_done(reviews[1]).await.unwrap(), vec![report]);
        assert_eq!(store.read(report).await.unwrap().status, TaskStatus::Ready);

        // Replaying a completion promotes nothing twice.
        assert!(graph.on_task_done(reviews[0]).await.unwrap().is_empty());
    }
}
