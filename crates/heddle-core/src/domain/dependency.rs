//! Dependency index over task ids.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (dependents)
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! Tasks reference each other by id only, so a cycle is a property of this
//! index, found with Kahn's algorithm in O(V + E).

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::ids::TaskId;
use super::task::{Task, TaskSpec};

#[derive(Debug, Clone, Default)]
pub struct DependencyIndex {
    nodes: BTreeSet<TaskId>,

    /// Forward edges: task -> tasks it depends on.
    edges: BTreeMap<TaskId, BTreeSet<TaskId>>,

    /// Reverse edges: task -> tasks waiting for it.
    reverse_edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a TaskSpec>) -> Self {
        let mut index = Self::new();
        for spec in specs {
            index.add_node(spec.id);
            for &dep in &spec.depends_on {
                index.add_dependency(spec.id, dep);
            }
        }
        index
    }

    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut index = Self::new();
        for task in tasks {
            index.add_node(task.id);
            for &dep in &task.depends_on {
                index.add_dependency(task.id, dep);
            }
        }
        index
    }

    /// Index only the edges whose both ends are among `tasks`.
    pub fn induced_by<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let tasks: Vec<&Task> = tasks.into_iter().collect();
        let mut index = Self::new();
        for task in &tasks {
            index.add_node(task.id);
        }
        for task in &tasks {
            for &dep in &task.depends_on {
                if index.contains(dep) {
                    index.add_dependency(task.id, dep);
                }
            }
        }
        index
    }

    pub fn add_node(&mut self, task: TaskId) {
        self.nodes.insert(task);
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Example: add_dependency(task_b, task_a) means "B waits for A".
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.nodes.insert(task);
        self.nodes.insert(depends_on);
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.nodes.contains(&task)
    }

    pub fn dependencies_of(&self, task: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.edges.get(&task).into_iter().flatten().copied()
    }

    pub fn dependents_of(&self, task: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.reverse_edges.get(&task).into_iter().flatten().copied()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    /// Kahn's algorithm: dependencies before dependents.
    ///
    /// Only edges between indexed nodes count. On a cycle, returns the nodes
    /// that could not be ordered (every cycle member plus anything downstream
    /// of one).
    pub fn topological_order(&self) -> Result<Vec<TaskId>, Vec<TaskId>> {
        let mut in_degree: BTreeMap<TaskId, usize> =
            self.nodes.iter().map(|&node| (node, 0)).collect();
        for (&task, deps) in &self.edges {
            let inside = deps.iter().filter(|dep| self.nodes.contains(dep)).count();
            if let Some(degree) = in_degree.get_mut(&task) {
                *degree += inside;
            }
        }

        let mut queue: VecDeque<TaskId> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&node, _)| node)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for dependent in self.dependents_of(node) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            let ordered: BTreeSet<TaskId> = order.into_iter().collect();
            Err(self
                .nodes
                .iter()
                .filter(|node| !ordered.contains(node))
                .copied()
                .collect())
        }
    }

    /// Returns the unorderable nodes if the graph has a cycle.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        self.topological_order().err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn ids<const N: usize>() -> [TaskId; N] {
        let mut ids = [TaskId::from_ulid(Ulid::nil()); N];
        for (i, id) in ids.iter_mut().enumerate() {
            *id = TaskId::from_ulid(Ulid::from_parts(1, i as u128 + 1));
        }
        ids
    }

    #[test]
    fn new_index_is_empty() {
        let index = DependencyIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.edge_count(), 0);
    }

    #[test]
    fn add_dependency_creates_both_edges() {
        let [a, b] = ids::<2>();
        let mut index = DependencyIndex::new();

        index.add_dependency(b, a); // B depends on A

        assert_eq!(index.dependencies_of(b).collect::<Vec<_>>(), vec![a]);
        assert_eq!(index.dependents_of(a).collect::<Vec<_>>(), vec![b]);
        assert_eq!(index.dependencies_of(a).count(), 0);
    }

    #[test]
    fn detect_simple_cycle() {
        let [a, b] = ids::<2>();
        let mut index = DependencyIndex::new();

        index.add_dependency(a, b);
        index.add_dependency(b, a);

        let cycle = index.detect_cycle().unwrap();
        assert_eq!(cycle.len(), 2);
    }

    #[test]
    fn detect_self_dependency() {
        let [a] = ids::<1>();
        let mut index = DependencyIndex::new();
        index.add_dependency(a, a);

        assert_eq!(index.detect_cycle(), Some(vec![a]));
    }

    #[test]
    fn detect_longer_cycle() {
        let [a, b, c, d] = ids::<4>();
        let mut index = DependencyIndex::new();

        // B -> C -> D -> B, with A upstream of the loop
        index.add_dependency(b, a);
        index.add_dependency(c, b);
        index.add_dependency(d, c);
        index.add_dependency(b, d);

        let stuck = index.detect_cycle().unwrap();
        assert!(!stuck.contains(&a));
        assert!(stuck.contains(&b) && stuck.contains(&c) && stuck.contains(&d));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let [a, b, c, d] = ids::<4>();
        let mut index = DependencyIndex::new();

        index.add_dependency(b, a);
        index.add_dependency(c, a);
        index.add_dependency(d, b);
        index.add_dependency(d, c);

        let order = index.topological_order().unwrap();
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert_eq!(order.len(), 4);
        assert!(pos(a) < pos(b) && pos(a) < pos(c));
        assert!(pos(b) < pos(d) && pos(c) < pos(d));
    }

    #[test]
    fn complex_dag_with_cross_edges() {
        let [a, b, c, d, e] = ids::<5>();
        let mut index = DependencyIndex::new();

        //     A
        //    / \
        //   B   C
        //   |\ /|
        //   | X |
        //   |/ \|
        //   D   E
        index.add_dependency(b, a);
        index.add_dependency(c, a);
        index.add_dependency(d, b);
        index.add_dependency(e, b);
        index.add_dependency(d, c);
        index.add_dependency(e, c);

        assert!(index.detect_cycle().is_none());
        assert_eq!(index.edge_count(), 6);
    }

    #[test]
    fn induced_index_ignores_edges_leaving_the_set() {
        let [a, b, outside] = ids::<3>();
        let now = chrono::Utc::now();
        let run_id = crate::domain::RunId::from_ulid(Ulid::new());
        let spec = |id, deps: &[TaskId]| TaskSpec {
            id,
            stage: "s".into(),
            depends_on: deps.iter().copied().collect(),
            payload: serde_json::Value::Null,
            max_attempts: 1,
        };
        let tasks = vec![
            Task::from_spec(run_id, spec(a, &[outside]), crate::domain::TaskStatus::Pending, now),
            Task::from_spec(run_id, spec(b, &[a]), crate::domain::TaskStatus::Pending, now),
        ];

        let induced = DependencyIndex::induced_by(&tasks);
        assert_eq!(induced.len(), 2);
        assert_eq!(induced.edge_count(), 1);
        assert!(!induced.contains(outside));

        let full = DependencyIndex::from_tasks(&tasks);
        assert_eq!(full.len(), 3);
    }
}
