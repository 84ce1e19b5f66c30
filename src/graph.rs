//! Step dependency graph

use std::collections::{BTreeSet, HashMap};

use crate::planner::StepId;

/// Node in the dependency graph
#[derive(Debug, Clone)]
struct GraphNode {
    /// Insertion rank; used to break ordering ties deterministically
    rank: usize,
    depends_on: Vec<StepId>,
    dependents: Vec<StepId>,
}

/// Directed graph of "step depends on step" edges
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<StepId, GraphNode>,
    order: Vec<StepId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(step, dependencies)` pairs; insertion order is the tie-break order
    pub fn from_edges<'a, I>(steps: I) -> Self
    where
        I: IntoIterator<Item = (&'a StepId, &'a [StepId])>,
    {
        let mut graph = Self::new();
        let steps: Vec<_> = steps.into_iter().collect();
        for (id, _) in &steps {
            graph.add_step((*id).clone());
        }
        for (id, deps) in &steps {
            for dep in deps.iter() {
                graph.add_dependency(id, dep);
            }
        }
        graph
    }

    /// Add a node with no edges. Re-adding is a no-op.
    pub fn add_step(&mut self, step_id: StepId) {
        if self.nodes.contains_key(&step_id) {
            return;
        }
        let rank = self.order.len();
        self.order.push(step_id.clone());
        self.nodes.insert(
            step_id,
            GraphNode {
                rank,
                depends_on: Vec::new(),
                dependents: Vec::new(),
            },
        );
    }

    /// Record that `step` depends on `dependency`; unknown ends are ignored
    pub fn add_dependency(&mut self, step: &StepId, dependency: &StepId) -> bool {
        if !self.nodes.contains_key(dependency) {
            return false;
        }
        let Some(node) = self.nodes.get_mut(step) else {
            return false;
        };
        if node.depends_on.contains(dependency) {
            return true;
        }
        node.depends_on.push(dependency.clone());
        if let Some(dep) = self.nodes.get_mut(dependency) {
            dep.dependents.push(step.clone());
        }
        true
    }

    pub fn dependencies(&self, step: &StepId) -> Vec<StepId> {
        self.nodes.get(step).map(|n| n.depends_on.clone()).unwrap_or_default()
    }

    pub fn dependents(&self, step: &StepId) -> Vec<StepId> {
        self.nodes.get(step).map(|n| n.dependents.clone()).unwrap_or_default()
    }

    pub fn has_edges(&self) -> bool {
        self.nodes.values().any(|n| !n.depends_on.is_empty())
    }

    /// Kahn's algorithm; ready steps are taken by insertion rank.
    ///
    /// On a cycle, returns the lowest-ranked step that could not be ordered.
    pub fn topological_order(&self) -> Result<Vec<StepId>, StepId> {
        let mut in_degree: HashMap<&StepId, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (id, node.depends_on.len()))
            .collect();
        let mut ready: BTreeSet<(usize, &StepId)> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.depends_on.is_empty())
            .map(|(id, node)| (node.rank, id))
            .collect();

        let mut sorted = Vec::with_capacity(self.nodes.len());
        while let Some((_, id)) = ready.pop_first() {
            sorted.push(id.clone());
            for dependent in &self.nodes[id].dependents {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert((self.nodes[dependent].rank, dependent));
                    }
                }
            }
        }

        if sorted.len() == self.nodes.len() {
            return Ok(sorted);
        }
        let stuck = self
            .order
            .iter()
            .find(|id| !sorted.contains(*id))
            .cloned()
            .unwrap_or_default();
        Err(stuck)
    }

    pub fn has_cycle(&self) -> bool {
        self.topological_order().is_err()
    }

    /// Longest path from any root to each step. `None` if cyclic.
    pub fn depths(&self) -> Option<HashMap<StepId, usize>> {
        let order = self.topological_order().ok()?;
        let mut depths: HashMap<StepId, usize> = HashMap::with_capacity(order.len());
        for id in order {
            let depth = self.nodes[&id]
                .depends_on
                .iter()
                .filter_map(|dep| depths.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depths.insert(id, depth);
        }
        Some(depths)
    }

    /// Steps grouped by depth: every step's dependencies sit in earlier waves
    pub fn waves(&self) -> Option<Vec<Vec<StepId>>> {
        let depths = self.depths()?;
        let mut waves: Vec<Vec<StepId>> = Vec::new();
        for id in &self.order {
            let depth = depths[id];
            if waves.len() <= depth {
                waves.resize_with(depth + 1, Vec::new);
            }
            waves[depth].push(id.clone());
        }
        Some(waves)
    }

    /// Whether `order` is a chain where each step depends on its predecessor
    pub fn is_chain(&self, order: &[StepId]) -> bool {
        order.windows(2).all(|pair| {
            self.nodes
                .get(&pair[1])
                .is_some_and(|n| n.depends_on.contains(&pair[0]))
        })
    }

    /// Every step reachable through dependent edges, excluding `step`
    pub fn transitive_dependents(&self, step: &StepId) -> Vec<StepId> {
        let mut seen: Vec<StepId> = Vec::new();
        let mut stack = self.dependents(step);
        while let Some(next) = stack.pop() {
            if &next == step || seen.contains(&next) {
                continue;
            }
            stack.extend(self.dependents(&next));
            seen.push(next);
        }
        seen.sort_by_key(|id| self.nodes.get(id).map(|n| n.rank).unwrap_or(usize::MAX));
        seen
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
