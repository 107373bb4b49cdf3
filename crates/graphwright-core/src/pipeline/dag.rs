use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;

use super::registry::ModelRegistry;
use crate::{Error, Result};

/// Stages grouped into levels. Stages within one level never depend on each
/// other; every dependency of a stage sits in an earlier level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    levels: Vec<Vec<String>>,
    /// Direct producer stages of each stage.
    upstream: BTreeMap<String, BTreeSet<String>>,
}

struct StageGraph {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl StageGraph {
    /// Edges run from producer to consumer.
    fn build(registry: &ModelRegistry) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        for name in registry.names() {
            nodes.insert(name.to_string(), graph.add_node(name.to_string()));
        }

        for model in registry.models() {
            let spec = model.spec();
            let consumer = nodes[&spec.name];
            for table in spec.referenced_tables() {
                if let Some(&producer) = nodes.get(table) {
                    graph.update_edge(producer, consumer, ());
                } else if !registry.is_base_table(table) {
                    return Err(Error::UnknownReference {
                        stage: spec.name.clone(),
                        table: table.to_string(),
                    });
                }
            }
        }

        Ok(Self { graph, nodes })
    }

    fn cycle_members(&self) -> Vec<String> {
        let mut members: Vec<String> = kosaraju_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .flatten()
            .map(|idx| self.graph[idx].clone())
            .collect();
        members.sort();
        members
    }

    fn levels(&self) -> Result<Vec<Vec<String>>> {
        let order = toposort(&self.graph, None).map_err(|_| Error::DependencyCycle(self.cycle_members()))?;

        // Longest path from any source decides the level.
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        for &node in &order {
            let level = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|pred| depth.get(&pred))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node, level);
        }

        let height = depth.values().max().map_or(0, |d| d + 1);
        let mut levels = vec![Vec::new(); height];
        for (node, level) in depth {
            levels[level].push(self.graph[node].clone());
        }
        for level in &mut levels {
            level.sort();
        }
        Ok(levels)
    }

    fn upstream(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.nodes
            .iter()
            .map(|(name, &node)| {
                let producers = self
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .map(|pred| self.graph[pred].clone())
                    .collect();
                (name.clone(), producers)
            })
            .collect()
    }

    /// The targets plus everything they transitively read from.
    fn upstream_closure(&self, targets: &[String]) -> Result<BTreeSet<String>> {
        let reversed = Reversed(&self.graph);
        let mut closure = BTreeSet::new();
        for target in targets {
            let &start = self
                .nodes
                .get(target)
                .ok_or_else(|| Error::UnknownStage(target.clone()))?;
            let mut dfs = Dfs::new(reversed, start);
            while let Some(node) = dfs.next(reversed) {
                closure.insert(self.graph[node].clone());
            }
        }
        Ok(closure)
    }
}

impl ExecutionPlan {
    /// Validates every reference in the registry and levels all stages.
    ///
    /// Fails before anything runs if a stage reads a table that no stage
    /// produces and that is not a base table, or if references form a cycle.
    pub fn build(registry: &ModelRegistry) -> Result<Self> {
        let graph = StageGraph::build(registry)?;
        Ok(Self {
            levels: graph.levels()?,
            upstream: graph.upstream(),
        })
    }

    /// Like [`ExecutionPlan::build`] but keeps only the named stages and their
    /// upstream dependencies. An empty target list keeps every stage.
    pub fn for_targets(registry: &ModelRegistry, targets: &[String]) -> Result<Self> {
        let graph = StageGraph::build(registry)?;
        let levels = graph.levels()?;
        let upstream = graph.upstream();
        if targets.is_empty() {
            return Ok(Self { levels, upstream });
        }

        let keep = graph.upstream_closure(targets)?;
        let levels = levels
            .into_iter()
            .map(|level| level.into_iter().filter(|s| keep.contains(s)).collect::<Vec<_>>())
            .filter(|level| !level.is_empty())
            .collect();
        Ok(Self { levels, upstream })
    }

    #[must_use]
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Stages whose output `stage` reads. Base tables are not listed.
    pub fn upstream_of(&self, stage: &str) -> impl Iterator<Item = &str> {
        self.upstream.get(stage).into_iter().flatten().map(String::as_str)
    }

    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.levels.iter().flatten().map(String::as_str)
    }

    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn describe(&self) -> String {
        self.levels
            .iter()
            .enumerate()
            .map(|(i, level)| format!("L{i}: {}", level.join(", ")))
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}
