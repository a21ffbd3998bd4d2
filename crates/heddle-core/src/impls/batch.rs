//! Validation shared by the stores' `create_tasks`.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::domain::{
    DependencyIndex, HeddleError, Result, RunId, Task, TaskId, TaskSpec, TaskStatus,
};

/// What a store already knows about an id referenced by a batch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Known {
    pub run_id: RunId,
    pub status: TaskStatus,
}

/// Every id a batch mentions: its own ids and all of their dependencies.
///
/// A store looks these up to build the `known` map for [`materialize`].
pub(crate) fn referenced_ids(specs: &[TaskSpec]) -> BTreeSet<TaskId> {
    specs
        .iter()
        .flat_map(|spec| std::iter::once(spec.id).chain(spec.depends_on.iter().copied()))
        .collect()
}

/// Check a batch against what the store holds and turn it into tasks.
///
/// `known` must contain every already-stored id among the batch's own ids and
/// its dependencies.
pub(crate) fn materialize(
    run_id: RunId,
    specs: Vec<TaskSpec>,
    known: &HashMap<TaskId, Known>,
    now: DateTime<Utc>,
) -> Result<Vec<Task>> {
    if specs.is_empty() {
        return Err(HeddleError::InvalidPipeline("no tasks to create".into()));
    }

    let mut own = BTreeSet::new();
    for spec in &specs {
        if !own.insert(spec.id) || known.contains_key(&spec.id) {
            return Err(HeddleError::InvalidPipeline(format!(
                "duplicate task id {}",
                spec.id
            )));
        }
        if spec.max_attempts == 0 {
            return Err(HeddleError::InvalidPipeline(format!(
                "{} allows zero attempts",
                spec.id
            )));
        }
    }

    for spec in &specs {
        for dep in &spec.depends_on {
            if own.contains(dep) {
                continue;
            }
            match known.get(dep) {
                Some(existing) if existing.run_id == run_id => {}
                Some(_) => {
                    return Err(HeddleError::InvalidPipeline(format!(
                        "{} depends on {dep} from another run",
                        spec.id
                    )));
                }
                None => {
                    return Err(HeddleError::InvalidPipeline(format!(
                        "{} depends on unknown task {dep}",
                        spec.id
                    )));
                }
            }
        }
    }

    if let Some(stuck) = DependencyIndex::from_specs(&specs).detect_cycle() {
        return Err(HeddleError::InvalidPipeline(format!(
            "dependency cycle among {} task(s)",
            stuck.len()
        )));
    }

    Ok(specs
        .into_iter()
        .map(|spec| {
            let ready = spec.depends_on.iter().all(|dep| {
                known
                    .get(dep)
                    .is_some_and(|existing| existing.status == TaskStatus::Done)
            });
            let status = if ready {
                TaskStatus::Ready
            } else {
                TaskStatus::Pending
            };
            Task::from_spec(run_id, spec, status, now)
        })
        .collect())
}
