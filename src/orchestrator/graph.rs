//! Stage dependency graph
//!
//! Edges point from an upstream stage to the stages that consume it. The
//! graph is fixed; gating and unlock cascades are reachability queries over
//! it.

use std::collections::HashMap;

use petgraph::graph::NodeIndex;
use petgraph::visit::{Dfs, Reversed};
use petgraph::{Directed, Graph};

use crate::models::StageType;

/// The eight-stage DAG
#[derive(Debug, Clone)]
pub struct StageGraph {
    graph: Graph<StageType, (), Directed>,
    node_map: HashMap<StageType, NodeIndex>,
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl StageGraph {
    /// Build the graph from each stage's declared upstreams
    pub fn new() -> Self {
        let mut graph = Graph::<StageType, (), Directed>::new();
        let mut node_map = HashMap::new();
        for stage in StageType::all() {
            node_map.insert(stage, graph.add_node(stage));
        }
        for stage in StageType::all() {
            for upstream in stage.upstream() {
                graph.add_edge(node_map[upstream], node_map[&stage], ());
            }
        }
        Self { graph, node_map }
    }

    /// Direct upstream stages, in declaration order
    pub fn upstream(&self, stage: StageType) -> Vec<StageType> {
        let mut upstream: Vec<StageType> = self
            .graph
            .neighbors_directed(self.node_map[&stage], petgraph::Direction::Incoming)
            .map(|n| self.graph[n])
            .collect();
        upstream.sort();
        upstream
    }

    /// Every stage reachable downstream of `stage`, excluding itself
    pub fn downstream(&self, stage: StageType) -> Vec<StageType> {
        let start = self.node_map[&stage];
        let mut dfs = Dfs::new(&self.graph, start);
        let mut reached = Vec::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                reached.push(self.graph[node]);
            }
        }
        reached.sort();
        reached
    }

    /// Every stage `stage` transitively depends on
    pub fn ancestors(&self, stage: StageType) -> Vec<StageType> {
        let start = self.node_map[&stage];
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut reached = Vec::new();
        while let Some(node) = dfs.next(reversed) {
            if node != start {
                reached.push(self.graph[node]);
            }
        }
        reached.sort();
        reached
    }

    /// Upstream stages that gate `stage`, given which stages exist in the run
    ///
    /// An optional upstream that was never created is replaced by its own
    /// effective upstreams.
    pub fn effective_upstream(
        &self,
        stage: StageType,
        exists: &dyn Fn(StageType) -> bool,
    ) -> Vec<StageType> {
        let mut result = Vec::new();
        for upstream in self.upstream(stage) {
            let expanded = if upstream.is_optional() && !exists(upstream) {
                self.effective_upstream(upstream, exists)
            } else {
                vec![upstream]
            };
            for candidate in expanded {
                if !result.contains(&candidate) {
                    result.push(candidate);
                }
            }
        }
        result.sort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_matches_declaration() {
        let graph = StageGraph::new();
        assert!(graph.upstream(StageType::Discovery).is_empty());
        assert_eq!(
            graph.upstream(StageType::Parse),
            vec![
                StageType::Selection,
                StageType::Context,
                StageType::TableSelection,
                StageType::Preview
            ]
        );
    }

    #[test]
    fn test_downstream_reachability() {
        let graph = StageGraph::new();
        assert_eq!(
            graph.downstream(StageType::TableAvailability),
            vec![
                StageType::TableSelection,
                StageType::Preview,
                StageType::Parse,
                StageType::Export
            ]
        );
        assert_eq!(graph.downstream(StageType::Export), Vec::<StageType>::new());
        assert_eq!(graph.downstream(StageType::Discovery).len(), 7);
    }

    #[test]
    fn test_ancestors() {
        let graph = StageGraph::new();
        assert_eq!(
            graph.ancestors(StageType::TableSelection),
            vec![
                StageType::Discovery,
                StageType::Selection,
                StageType::TableAvailability
            ]
        );
        assert_eq!(graph.ancestors(StageType::Export).len(), 7);
        assert!(graph.ancestors(StageType::Discovery).is_empty());
    }

    #[test]
    fn test_effective_upstream_skips_missing_optionals() {
        let graph = StageGraph::new();
        let none = |_: StageType| false;
        assert_eq!(
            graph.effective_upstream(StageType::Parse, &none),
            vec![StageType::Selection]
        );

        let with_context = |s: StageType| s == StageType::Context;
        assert_eq!(
            graph.effective_upstream(StageType::Parse, &with_context),
            vec![StageType::Selection, StageType::Context]
        );

        // availability exists but selection of tables was skipped
        let partial = |s: StageType| s == StageType::TableAvailability;
        assert_eq!(
            graph.effective_upstream(StageType::Parse, &partial),
            vec![StageType::Selection, StageType::TableAvailability]
        );
    }
}
