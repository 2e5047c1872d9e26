//! The task DAG
//!
//! Expands the package-level dependency graph and the pipeline into a graph
//! over task IDs. `dependsOn: ["^build"]` wires a task to the same task in
//! every upstream package; plain entries wire tasks within one package.
//! Tasks pulled in as prerequisites join the graph even when they are not
//! run targets themselves.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::{debug, info};

use gantry_core::error::GraphError;
use gantry_core::package::PackageGraph;
use gantry_core::pipeline::Pipeline;

use crate::task::{PackageTask, TaskId};

/// A node in the task graph
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// The package-task this node executes
    pub task: PackageTask,
    /// Direct prerequisites
    pub dependencies: HashSet<TaskId>,
    /// Direct dependents
    pub dependents: HashSet<TaskId>,
}

/// Directed acyclic graph over task IDs
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: HashMap<TaskId, TaskNode>,
    sorted_order: Vec<TaskId>,
}

impl TaskGraph {
    /// Build the task graph for `targets` across `packages`.
    ///
    /// Prerequisite tasks referenced by the pipeline are added transitively;
    /// upstream-package prerequisites are followed even outside the filtered
    /// package set, since their artifacts are needed first.
    pub fn build(
        package_graph: &PackageGraph,
        pipeline: &Pipeline,
        targets: &[String],
        packages: &[String],
    ) -> Result<Self, GraphError> {
        let mut nodes: HashMap<TaskId, TaskNode> = HashMap::new();
        let mut worklist: VecDeque<TaskId> = VecDeque::new();

        for pkg in packages {
            for target in targets {
                if pipeline.get(target).is_none() {
                    return Err(GraphError::TaskNotFound(target.clone()));
                }
                worklist.push_back(TaskId::new(pkg.clone(), target.clone()));
            }
        }

        while let Some(id) = worklist.pop_front() {
            if nodes.contains_key(&id) {
                continue;
            }

            let definition = pipeline
                .get(&id.task)
                .ok_or_else(|| GraphError::TaskNotFound(id.task.clone()))?
                .clone();
            let pkg = package_graph
                .package(&id.package)
                .ok_or_else(|| GraphError::PackageNotFound(id.package.clone()))?
                .clone();

            let mut dependencies: HashSet<TaskId> = HashSet::new();

            for dep_task in definition.task_dependencies() {
                if pipeline.get(dep_task).is_none() {
                    return Err(GraphError::TaskNotFound(dep_task.to_string()));
                }
                let dep_id = TaskId::new(id.package.clone(), dep_task);
                dependencies.insert(dep_id.clone());
                worklist.push_back(dep_id);
            }

            for dep_task in definition.topological_dependencies() {
                if pipeline.get(dep_task).is_none() {
                    return Err(GraphError::TaskNotFound(dep_task.to_string()));
                }
                for dep_pkg in package_graph.dependencies(&id.package) {
                    let dep_id = TaskId::new(dep_pkg, dep_task);
                    dependencies.insert(dep_id.clone());
                    worklist.push_back(dep_id);
                }
            }

            let task = PackageTask::new(id.clone(), pkg, definition);
            nodes.insert(
                id,
                TaskNode {
                    task,
                    dependencies,
                    dependents: HashSet::new(),
                },
            );
        }

        // Reverse edges
        let edges: Vec<(TaskId, Vec<TaskId>)> = nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.dependencies.iter().cloned().collect()))
            .collect();
        for (id, deps) in edges {
            for dep in deps {
                if let Some(dep_node) = nodes.get_mut(&dep) {
                    dep_node.dependents.insert(id.clone());
                }
            }
        }

        let sorted_order = Self::topological_sort(&nodes)?;

        info!(task_count = nodes.len(), "task graph built");
        Ok(Self {
            nodes,
            sorted_order,
        })
    }

    /// Topological sort using Kahn's algorithm; rejects cycles
    fn topological_sort(nodes: &HashMap<TaskId, TaskNode>) -> Result<Vec<TaskId>, GraphError> {
        let mut in_degree: HashMap<TaskId, usize> = HashMap::new();
        let mut queue: VecDeque<TaskId> = VecDeque::new();
        let mut sorted: Vec<TaskId> = Vec::new();

        for (id, node) in nodes {
            let degree = node.dependencies.len();
            in_degree.insert(id.clone(), degree);
            if degree == 0 {
                queue.push_back(id.clone());
            }
        }

        while let Some(id) = queue.pop_front() {
            sorted.push(id.clone());

            if let Some(node) = nodes.get(&id) {
                for dependent in &node.dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
        }

        if sorted.len() != nodes.len() {
            let in_sorted: HashSet<_> = sorted.iter().collect();
            let cyclic: Vec<String> = nodes
                .keys()
                .filter(|id| !in_sorted.contains(id))
                .map(|id| id.to_string())
                .collect();
            debug!(cyclic = ?cyclic, "cycle detected in task graph");
            return Err(GraphError::CyclicDependency(cyclic.join(", ")));
        }

        Ok(sorted)
    }

    /// Get a task node
    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// All nodes
    pub fn nodes(&self) -> &HashMap<TaskId, TaskNode> {
        &self.nodes
    }

    /// Direct prerequisites, sorted for determinism
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        let mut deps: Vec<TaskId> = self
            .nodes
            .get(id)
            .map(|n| n.dependencies.iter().cloned().collect())
            .unwrap_or_default();
        deps.sort();
        deps
    }

    /// All transitive prerequisites, sorted
    pub fn ancestors(&self, id: &TaskId) -> Vec<TaskId> {
        self.walk(id, |node| &node.dependencies)
    }

    /// All transitive dependents, sorted
    pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
        self.walk(id, |node| &node.dependents)
    }

    fn walk<'a, F>(&'a self, start: &TaskId, edges: F) -> Vec<TaskId>
    where
        F: Fn(&'a TaskNode) -> &'a HashSet<TaskId>,
    {
        let mut seen: BTreeSet<TaskId> = BTreeSet::new();
        let mut queue: VecDeque<&TaskId> = VecDeque::new();
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.nodes.get(current) {
                for next in edges(node) {
                    if seen.insert(next.clone()) {
                        queue.push_back(next);
                    }
                }
            }
        }

        seen.into_iter().collect()
    }

    /// Topologically sorted task order
    pub fn sorted(&self) -> &[TaskId] {
        &self.sorted_order
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no tasks
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::package::PackageInfo;
    use gantry_core::pipeline::TaskDefinition;
    use std::collections::HashMap as StdHashMap;

    fn package(name: &str, deps: &[&str]) -> PackageInfo {
        PackageInfo {
            name: name.to_string(),
            dir: format!("packages/{}", name).into(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            scripts: StdHashMap::from([
                ("build".to_string(), "npm run compile".to_string()),
                ("test".to_string(), "npm run jest".to_string()),
            ]),
            external_deps_hash: String::new(),
            framework: String::new(),
        }
    }

    fn package_graph() -> PackageGraph {
        PackageGraph::build(&[
            package("core", &[]),
            package("util", &["core"]),
            package("app", &["core", "util"]),
        ])
        .unwrap()
    }

    fn pipeline() -> Pipeline {
        [
            (
                "build".to_string(),
                TaskDefinition::new().with_depends_on("^build"),
            ),
            (
                "test".to_string(),
                TaskDefinition::new().with_depends_on("build"),
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_build_expands_topological_deps() {
        let graph = TaskGraph::build(
            &package_graph(),
            &pipeline(),
            &["build".to_string()],
            &["app".to_string()],
        )
        .unwrap();

        // app#build pulls in util#build and core#build even though only
        // app is filtered
        assert_eq!(graph.len(), 3);

        let deps = graph.dependencies(&TaskId::new("app", "build"));
        assert_eq!(
            deps,
            vec![TaskId::new("core", "build"), TaskId::new("util", "build")]
        );
    }

    #[test]
    fn test_same_package_dependency() {
        let graph = TaskGraph::build(
            &package_graph(),
            &pipeline(),
            &["test".to_string()],
            &["core".to_string()],
        )
        .unwrap();

        let deps = graph.dependencies(&TaskId::new("core", "test"));
        assert_eq!(deps, vec![TaskId::new("core", "build")]);
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let graph = TaskGraph::build(
            &package_graph(),
            &pipeline(),
            &["test".to_string()],
            &["util".to_string()],
        )
        .unwrap();

        let ancestors = graph.ancestors(&TaskId::new("util", "test"));
        assert!(ancestors.contains(&TaskId::new("util", "build")));
        assert!(ancestors.contains(&TaskId::new("core", "build")));

        let descendants = graph.descendants(&TaskId::new("core", "build"));
        assert!(descendants.contains(&TaskId::new("util", "test")));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let result = TaskGraph::build(
            &package_graph(),
            &pipeline(),
            &["deploy".to_string()],
            &["core".to_string()],
        );
        assert!(matches!(result, Err(GraphError::TaskNotFound(_))));
    }

    #[test]
    fn test_cycle_rejected() {
        let cyclic: Pipeline = [
            (
                "a".to_string(),
                TaskDefinition::new().with_depends_on("b"),
            ),
            (
                "b".to_string(),
                TaskDefinition::new().with_depends_on("a"),
            ),
        ]
        .into_iter()
        .collect();

        let result = TaskGraph::build(
            &package_graph(),
            &cyclic,
            &["a".to_string()],
            &["core".to_string()],
        );
        assert!(matches!(result, Err(GraphError::CyclicDependency(_))));
    }

    #[test]
    fn test_sorted_respects_dependencies() {
        let graph = TaskGraph::build(
            &package_graph(),
            &pipeline(),
            &["build".to_string()],
            &["app".to_string()],
        )
        .unwrap();

        let sorted = graph.sorted();
        let pos = |id: &TaskId| sorted.iter().position(|s| s == id).unwrap();

        assert!(pos(&TaskId::new("core", "build")) < pos(&TaskId::new("util", "build")));
        assert!(pos(&TaskId::new("util", "build")) < pos(&TaskId::new("app", "build")));
    }
}
