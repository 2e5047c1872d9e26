//! Workspace packages and the package dependency graph

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Reserved package name for tasks declared at the repository root.
pub const ROOT_PACKAGE_NAME: &str = "//";

/// A package in the monorepo, as supplied by workspace discovery.
///
/// Gantry does not parse manifests itself; the discovery collaborator hands
/// us the resolved view of each package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    /// Unique package name
    pub name: String,
    /// Repo-relative directory
    pub dir: PathBuf,
    /// Names of workspace packages this package depends on
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Task name -> shell command, from the package manifest
    #[serde(default)]
    pub scripts: HashMap<String, String>,
    /// Digest of the package's external (registry) dependencies,
    /// opaque hex supplied by the lockfile collaborator
    #[serde(default)]
    pub external_deps_hash: String,
    /// Detected framework, if any (informational, surfaced in summaries)
    #[serde(default)]
    pub framework: String,
}

impl PackageInfo {
    /// Command for a named task, if the package declares it
    pub fn command(&self, task: &str) -> Option<&str> {
        self.scripts.get(task).map(String::as_str)
    }
}

/// A node in the package dependency graph
#[derive(Debug, Clone)]
pub struct PackageNode {
    /// Package name
    pub name: String,
    /// Packages this package depends on
    pub dependencies: Vec<String>,
    /// Packages that depend on this package
    pub dependents: Vec<String>,
}

/// Dependency graph over workspace packages.
///
/// Consumed pre-built: edges come straight from the discovery collaborator's
/// declared workspace dependencies.
#[derive(Debug, Clone)]
pub struct PackageGraph {
    nodes: HashMap<String, PackageNode>,
    packages: HashMap<String, PackageInfo>,
    sorted_order: Vec<String>,
}

impl PackageGraph {
    /// Build the graph from discovered packages. Rejects cyclic inputs.
    pub fn build(packages: &[PackageInfo]) -> Result<Self, GraphError> {
        let mut nodes: HashMap<String, PackageNode> = HashMap::new();
        let mut by_name: HashMap<String, PackageInfo> = HashMap::new();

        for pkg in packages {
            nodes.insert(
                pkg.name.clone(),
                PackageNode {
                    name: pkg.name.clone(),
                    dependencies: pkg.dependencies.clone(),
                    dependents: Vec::new(),
                },
            );
            by_name.insert(pkg.name.clone(), pkg.clone());
        }

        for pkg in packages {
            for dep in &pkg.dependencies {
                if !nodes.contains_key(dep) {
                    return Err(GraphError::PackageNotFound(dep.clone()));
                }
            }
        }

        // Reverse dependency mapping
        for pkg in packages {
            for dep in &pkg.dependencies {
                if let Some(dep_node) = nodes.get_mut(dep) {
                    dep_node.dependents.push(pkg.name.clone());
                }
            }
        }

        let sorted_order = Self::topological_sort(&nodes)?;

        Ok(Self {
            nodes,
            packages: by_name,
            sorted_order,
        })
    }

    /// Topological sort using Kahn's algorithm
    fn topological_sort(nodes: &HashMap<String, PackageNode>) -> Result<Vec<String>, GraphError> {
        let mut in_degree: HashMap<String, usize> = HashMap::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut sorted: Vec<String> = Vec::new();

        for (name, node) in nodes {
            let degree = node
                .dependencies
                .iter()
                .filter(|d| nodes.contains_key(*d))
                .count();
            in_degree.insert(name.clone(), degree);
            if degree == 0 {
                queue.push_back(name.clone());
            }
        }

        while let Some(name) = queue.pop_front() {
            sorted.push(name.clone());

            if let Some(node) = nodes.get(&name) {
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
                .filter(|n| !in_sorted.contains(n))
                .cloned()
                .collect();
            return Err(GraphError::CyclicDependency(cyclic.join(", ")));
        }

        Ok(sorted)
    }

    /// Packages in topologically sorted order (dependencies first)
    pub fn sorted(&self) -> &[String] {
        &self.sorted_order
    }

    /// Get a package by name
    pub fn package(&self, name: &str) -> Option<&PackageInfo> {
        self.packages.get(name)
    }

    /// Direct dependencies of a package
    pub fn dependencies(&self, name: &str) -> HashSet<String> {
        self.nodes
            .get(name)
            .map(|n| n.dependencies.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of a package
    pub fn dependents(&self, name: &str) -> HashSet<String> {
        self.nodes
            .get(name)
            .map(|n| n.dependents.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of packages in the graph
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_packages() -> Vec<PackageInfo> {
        vec![
            PackageInfo {
                name: "core".to_string(),
                dir: "packages/core".into(),
                dependencies: vec![],
                scripts: HashMap::new(),
                external_deps_hash: String::new(),
                framework: String::new(),
            },
            PackageInfo {
                name: "util".to_string(),
                dir: "packages/util".into(),
                dependencies: vec!["core".to_string()],
                scripts: HashMap::new(),
                external_deps_hash: String::new(),
                framework: String::new(),
            },
            PackageInfo {
                name: "app".to_string(),
                dir: "packages/app".into(),
                dependencies: vec!["core".to_string(), "util".to_string()],
                scripts: HashMap::new(),
                external_deps_hash: String::new(),
                framework: String::new(),
            },
        ]
    }

    #[test]
    fn test_build_graph() {
        let graph = PackageGraph::build(&create_packages()).unwrap();
        assert_eq!(graph.sorted().len(), 3);
    }

    #[test]
    fn test_topological_order() {
        let graph = PackageGraph::build(&create_packages()).unwrap();
        let sorted = graph.sorted();

        let core_pos = sorted.iter().position(|n| n == "core").unwrap();
        let util_pos = sorted.iter().position(|n| n == "util").unwrap();
        let app_pos = sorted.iter().position(|n| n == "app").unwrap();

        assert!(core_pos < util_pos);
        assert!(util_pos < app_pos);
    }

    #[test]
    fn test_dependents() {
        let graph = PackageGraph::build(&create_packages()).unwrap();

        let core_dependents = graph.dependents("core");
        assert!(core_dependents.contains("util"));
        assert!(core_dependents.contains("app"));
        assert!(graph.dependents("app").is_empty());
    }

    #[test]
    fn test_cycle_rejected() {
        let mut packages = create_packages();
        packages[0].dependencies = vec!["app".to_string()];

        let result = PackageGraph::build(&packages);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut packages = create_packages();
        packages[1].dependencies = vec!["nope".to_string()];

        let result = PackageGraph::build(&packages);
        assert!(result.is_err());
    }
}
