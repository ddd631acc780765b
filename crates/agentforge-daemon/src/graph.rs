//! In-memory feature dependency graph.
//!
//! [`FeatureGraph`] is the authoritative view of features and their
//! dependency edges. Every mutation is validated first: unknown targets,
//! self-edges, the per-feature dependency cap, and cycles (Kahn's algorithm
//! over the candidate edge set, then a DFS to report the offending path).
//! A rejected mutation leaves the graph untouched.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use agentforge_core::ErrorKind;
use agentforge_core::model::{
    BlockedFeature, Feature, FeatureId, FeatureStats, FeatureStatus, GraphEdge, GraphNode,
    GraphNodeStatus, GraphView,
};

/// Most dependencies a single feature may declare.
pub const MAX_DEPENDENCIES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Feature {0} not found")]
    NotFound(FeatureId),

    #[error("Unknown dependency: feature {0} does not exist")]
    UnknownDependency(FeatureId),

    #[error("Feature {0} cannot depend on itself")]
    SelfDependency(FeatureId),

    #[error("Dependency cycle detected: {}", format_path(.path))]
    CycleDetected { path: Vec<FeatureId> },

    #[error("{0} dependencies declared (max {MAX_DEPENDENCIES})")]
    TooManyDependencies(usize),
}

impl GraphError {
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::CycleDetected { .. } => Some(ErrorKind::CycleDetected),
            _ => None,
        }
    }
}

fn format_path(path: &[FeatureId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Default, Clone)]
pub struct FeatureGraph {
    nodes: BTreeMap<FeatureId, Feature>,
}

impl FeatureGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored features. Edges to missing features are dropped.
    pub fn from_features(features: impl IntoIterator<Item = Feature>) -> Result<Self, GraphError> {
        let mut nodes: BTreeMap<FeatureId, Feature> =
            features.into_iter().map(|f| (f.id, f)).collect();
        let ids: HashSet<FeatureId> = nodes.keys().copied().collect();
        for feature in nodes.values_mut() {
            feature.dependencies.retain(|d| ids.contains(d) && *d != feature.id);
        }

        let graph = Self { nodes };
        if let Some(cycle) = graph.find_any_cycle() {
            return Err(GraphError::CycleDetected { path: cycle });
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: FeatureId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: FeatureId) -> Option<&Feature> {
        self.nodes.get(&id)
    }

    /// All features ordered by id.
    pub fn all(&self) -> impl Iterator<Item = &Feature> {
        self.nodes.values()
    }

    /// Ids of features that depend directly on `id`.
    pub fn dependents(&self, id: FeatureId) -> Vec<FeatureId> {
        self.nodes
            .values()
            .filter(|f| f.dependencies.contains(&id))
            .map(|f| f.id)
            .collect()
    }

    /// Validate dependencies for a feature that is not stored yet. A new
    /// node has no dependents, so it cannot close a cycle.
    pub fn check_new(&self, deps: &BTreeSet<FeatureId>) -> Result<(), GraphError> {
        if deps.len() > MAX_DEPENDENCIES {
            return Err(GraphError::TooManyDependencies(deps.len()));
        }
        match deps.iter().find(|d| !self.nodes.contains_key(d)) {
            Some(&unknown) => Err(GraphError::UnknownDependency(unknown)),
            None => Ok(()),
        }
    }

    /// Validate a dependency set for `id` without mutating. `id` need not
    /// exist yet.
    pub fn check_dependencies(
        &self,
        id: FeatureId,
        deps: &BTreeSet<FeatureId>,
    ) -> Result<(), GraphError> {
        if deps.contains(&id) {
            return Err(GraphError::SelfDependency(id));
        }
        self.check_new(deps)?;

        if !self.nodes.contains_key(&id) || self.is_acyclic_with(id, deps) {
            return Ok(());
        }
        let path = self
            .cycle_path_from(id, deps)
            .or_else(|| self.find_any_cycle())
            .unwrap_or_else(|| vec![id, id]);
        Err(GraphError::CycleDetected { path })
    }

    /// Insert a new node or replace an existing node's dependency set.
    pub fn add_feature(&mut self, feature: Feature) -> Result<(), GraphError> {
        self.check_dependencies(feature.id, &feature.dependencies)?;
        self.nodes.insert(feature.id, feature);
        Ok(())
    }

    /// Replace the dependency set of an existing feature.
    pub fn set_dependencies(
        &mut self,
        id: FeatureId,
        deps: BTreeSet<FeatureId>,
    ) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&id) {
            return Err(GraphError::NotFound(id));
        }
        self.check_dependencies(id, &deps)?;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.dependencies = deps;
        }
        Ok(())
    }

    /// Whether adding the edge `id -> dep` would close a cycle.
    pub fn would_create_cycle(&self, id: FeatureId, dep: FeatureId) -> bool {
        if id == dep {
            return true;
        }
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        let mut deps = node.dependencies.clone();
        deps.insert(dep);
        !self.is_acyclic_with(id, &deps)
    }

    /// Remove a node and strip it from every dependent's dependency set.
    pub fn remove_feature(&mut self, id: FeatureId) -> Option<Feature> {
        let removed = self.nodes.remove(&id)?;
        for node in self.nodes.values_mut() {
            node.dependencies.remove(&id);
        }
        Some(removed)
    }

    /// Mutate a node's queue and claim fields. The dependency set is kept
    /// as-is; use [`set_dependencies`](Self::set_dependencies) for edges.
    pub fn update<F>(&mut self, id: FeatureId, f: F) -> Option<Feature>
    where
        F: FnOnce(&mut Feature),
    {
        let node = self.nodes.get_mut(&id)?;
        let deps = node.dependencies.clone();
        f(node);
        node.id = id;
        node.dependencies = deps;
        Some(node.clone())
    }

    pub fn is_ready(&self, feature: &Feature) -> bool {
        feature.status == FeatureStatus::Pending
            && feature.claimed_by.is_none()
            && feature.dependencies.iter().all(|d| {
                self.nodes
                    .get(d)
                    .is_some_and(|dep| dep.status == FeatureStatus::Passing)
            })
    }

    /// Claimable features, highest priority first, then FIFO, then id.
    pub fn ready_set(&self) -> Vec<Feature> {
        let mut ready: Vec<Feature> = self
            .nodes
            .values()
            .filter(|f| self.is_ready(f))
            .cloned()
            .collect();
        ready.sort_by_key(|f| (f.priority, f.enqueued_at, f.id));
        ready
    }

    /// Pending features waiting on dependencies that are not passing.
    pub fn blocked(&self) -> Vec<BlockedFeature> {
        self.nodes
            .values()
            .filter(|f| f.status == FeatureStatus::Pending)
            .filter_map(|f| {
                let blocked_by = self.unmet_dependencies(f);
                (!blocked_by.is_empty()).then(|| BlockedFeature {
                    feature: f.clone(),
                    blocked_by,
                })
            })
            .collect()
    }

    /// Every node with its derived display status, plus one edge per
    /// dependency, in id order.
    pub fn view(&self) -> GraphView {
        let mut view = GraphView::default();
        for f in self.nodes.values() {
            let blocked = !self.unmet_dependencies(f).is_empty();
            view.nodes.push(GraphNode {
                id: f.id,
                name: f.name.clone(),
                category: f.category.clone(),
                status: GraphNodeStatus::derive(f.status, blocked),
                priority: f.priority,
                dependencies: f.dependencies.clone(),
            });
            view.edges.extend(f.dependencies.iter().map(|&source| GraphEdge {
                source,
                target: f.id,
            }));
        }
        view
    }

    fn unmet_dependencies(&self, feature: &Feature) -> Vec<FeatureId> {
        feature
            .dependencies
            .iter()
            .copied()
            .filter(|d| {
                self.nodes
                    .get(d)
                    .is_none_or(|dep| dep.status != FeatureStatus::Passing)
            })
            .collect()
    }

    /// Passing, unclaimed features, least recently verified first.
    pub fn regression_candidates(&self) -> Vec<Feature> {
        let mut candidates: Vec<Feature> = self
            .nodes
            .values()
            .filter(|f| f.status == FeatureStatus::Passing && f.claimed_by.is_none())
            .cloned()
            .collect();
        candidates.sort_by_key(|f| (f.last_tested_at.is_some(), f.last_tested_at, f.id));
        candidates
    }

    pub fn stats(&self) -> FeatureStats {
        FeatureStats::from_statuses(self.nodes.values().map(|f| f.status))
    }

    pub fn all_passing(&self) -> bool {
        !self.nodes.is_empty()
            && self
                .nodes
                .values()
                .all(|f| f.status == FeatureStatus::Passing)
    }

    /// Kahn's algorithm over the current edges with `id`'s set replaced.
    fn is_acyclic_with(&self, id: FeatureId, deps: &BTreeSet<FeatureId>) -> bool {
        let mut remaining: HashMap<FeatureId, usize> = HashMap::new();
        let mut dependents: HashMap<FeatureId, Vec<FeatureId>> = HashMap::new();
        for (&node, feature) in &self.nodes {
            let node_deps = if node == id { deps } else { &feature.dependencies };
            remaining.insert(node, node_deps.len());
            for &dep in node_deps {
                dependents.entry(dep).or_default().push(node);
            }
        }

        let mut queue: VecDeque<FeatureId> = remaining
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&node, _)| node)
            .collect();
        let mut ordered = 0usize;
        while let Some(node) = queue.pop_front() {
            ordered += 1;
            for &dependent in dependents.get(&node).map_or(&[][..], Vec::as_slice) {
                if let Some(deg) = remaining.get_mut(&dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
        ordered == self.nodes.len()
    }

    /// DFS along dependency edges from `id` back to `id`.
    fn cycle_path_from(&self, id: FeatureId, deps: &BTreeSet<FeatureId>) -> Option<Vec<FeatureId>> {
        let mut path = vec![id];
        let mut visited = HashSet::new();
        for &dep in deps {
            if self.dfs_to(dep, id, &mut path, &mut visited) {
                return Some(path);
            }
        }
        None
    }

    fn dfs_to(
        &self,
        node: FeatureId,
        target: FeatureId,
        path: &mut Vec<FeatureId>,
        visited: &mut HashSet<FeatureId>,
    ) -> bool {
        path.push(node);
        if node == target {
            return true;
        }
        if visited.insert(node)
            && let Some(feature) = self.nodes.get(&node)
        {
            for &next in &feature.dependencies {
                if self.dfs_to(next, target, path, visited) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    fn find_any_cycle(&self) -> Option<Vec<FeatureId>> {
        for (&id, node) in &self.nodes {
            if let Some(path) = self.cycle_path_from(id, &node.dependencies) {
                return Some(path);
            }
        }
        None
    }
}
