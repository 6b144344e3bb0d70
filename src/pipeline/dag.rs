// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! DAG (Directed Acyclic Graph) builder for pipeline dependencies
//!
//! Builds and validates dependency graphs for pipeline stages,
//! ensuring proper execution order and detecting cycles.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::errors::StagehandError;
use crate::pipeline::{Pipeline, TriggerEvent};

/// Builder for stage dependency DAGs
pub struct DagBuilder {
    graph: DiGraph<usize, ()>,
    id_to_index: HashMap<String, NodeIndex>,
    index_to_id: HashMap<NodeIndex, String>,
    /// Node of each stage, in declaration order
    nodes: Vec<NodeIndex>,
}

impl DagBuilder {
    /// Create a new DAG builder
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            id_to_index: HashMap::new(),
            index_to_id: HashMap::new(),
            nodes: Vec::new(),
        }
    }

    /// Build a DAG from a pipeline
    pub fn build(pipeline: &Pipeline) -> Result<Self, StagehandError> {
        let mut builder = Self::new();

        // Add all stages as nodes
        for (idx, stage) in pipeline.stages.iter().enumerate() {
            let node = builder.graph.add_node(idx);
            builder.id_to_index.insert(stage.id.clone(), node);
            builder.index_to_id.insert(node, stage.id.clone());
            builder.nodes.push(node);
        }

        // Add dependency edges, upstream -> consumer
        for stage in &pipeline.stages {
            let stage_node = builder.id_to_index[&stage.id];

            for upstream in stage.upstream_ids() {
                let dep_node = builder.id_to_index.get(upstream).ok_or_else(|| {
                    StagehandError::UnknownDependency {
                        stage: stage.id.clone(),
                        dependency: upstream.to_string(),
                    }
                })?;

                if !builder.graph.contains_edge(*dep_node, stage_node) {
                    builder.graph.add_edge(*dep_node, stage_node, ());
                }
            }
        }

        // Validate no cycles
        builder.validate_acyclic()?;

        Ok(builder)
    }

    /// Validate that the graph is acyclic
    fn validate_acyclic(&self) -> Result<(), StagehandError> {
        toposort(&self.graph, None).map(|_| ()).map_err(|cycle| {
            StagehandError::CircularDependency {
                stages: self.find_cycle_members(cycle.node_id()),
            }
        })
    }

    /// Walk back from `start` along incoming edges until a node repeats
    fn find_cycle_members(&self, start: NodeIndex) -> Vec<String> {
        let mut path = vec![start];
        let mut current = start;

        loop {
            // Any upstream that itself reaches `start` keeps us on the cycle
            let next = self
                .graph
                .neighbors_directed(current, Direction::Outgoing)
                .find(|n| petgraph::algo::has_path_connecting(&self.graph, *n, start, None));
            let Some(next) = next else {
                break;
            };
            if let Some(pos) = path.iter().position(|n| *n == next) {
                path.drain(..pos);
                path.push(next);
                break;
            }
            path.push(next);
            current = next;
        }

        path.into_iter()
            .map(|n| self.index_to_id[&n].clone())
            .collect()
    }

    /// Stage indices in dependency order, ties broken by declaration order
    pub fn topological_order(&self) -> Result<Vec<usize>, StagehandError> {
        self.validate_acyclic()?;

        let mut in_degree: HashMap<NodeIndex, usize> = self
            .nodes
            .iter()
            .map(|n| {
                (
                    *n,
                    self.graph.neighbors_directed(*n, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = self
            .nodes
            .iter()
            .filter(|n| in_degree[n] == 0)
            .map(|n| Reverse(self.graph[*n]))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for next in self
                .graph
                .neighbors_directed(self.nodes[idx], Direction::Outgoing)
            {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(self.graph[next]));
                    }
                }
            }
        }

        Ok(order)
    }

    /// Get topologically sorted stage ids
    pub fn topological_order_ids(&self) -> Result<Vec<String>, StagehandError> {
        Ok(self
            .topological_order()?
            .into_iter()
            .map(|idx| self.index_to_id[&self.nodes[idx]].clone())
            .collect())
    }

    /// Get dependencies for a stage (stages that must run before it)
    pub fn dependencies(&self, stage_id: &str) -> Option<Vec<String>> {
        self.neighbors(stage_id, Direction::Incoming)
    }

    /// Get dependents for a stage (stages that depend on it)
    pub fn dependents(&self, stage_id: &str) -> Option<Vec<String>> {
        self.neighbors(stage_id, Direction::Outgoing)
    }

    fn neighbors(&self, stage_id: &str, direction: Direction) -> Option<Vec<String>> {
        let node = self.id_to_index.get(stage_id)?;
        let mut ids: Vec<(usize, String)> = self
            .graph
            .neighbors_directed(*node, direction)
            .map(|n| (self.graph[n], self.index_to_id[&n].clone()))
            .collect();
        ids.sort();
        Some(ids.into_iter().map(|(_, id)| id).collect())
    }

    /// Check if stage A depends (directly or transitively) on stage B
    pub fn depends_on(&self, stage_a: &str, stage_b: &str) -> bool {
        let Some(node_a) = self.id_to_index.get(stage_a) else {
            return false;
        };
        let Some(node_b) = self.id_to_index.get(stage_b) else {
            return false;
        };

        node_a != node_b && petgraph::algo::has_path_connecting(&self.graph, *node_b, *node_a, None)
    }

    /// Stages a run should execute
    ///
    /// `only` (from `--stage`) wins over the trigger. A manual trigger selects
    /// every stage; a change event selects stages whose change filter matches a
    /// changed path. Transitive upstreams of a selected stage are always added.
    pub fn select(
        &self,
        pipeline: &Pipeline,
        trigger: &TriggerEvent,
        only: &[String],
    ) -> Result<BTreeSet<usize>, StagehandError> {
        let roots: Vec<usize> = if !only.is_empty() {
            only.iter()
                .map(|id| {
                    self.id_to_index
                        .get(id)
                        .map(|n| self.graph[*n])
                        .ok_or_else(|| StagehandError::StageNotFound { stage: id.clone() })
                })
                .collect::<Result<_, _>>()?
        } else {
            match trigger {
                TriggerEvent::Manual => (0..pipeline.stages.len()).collect(),
                TriggerEvent::Change { paths } => pipeline
                    .stages
                    .iter()
                    .enumerate()
                    .filter(|(_, stage)| paths.iter().any(|p| stage.trigger.matches_change(p)))
                    .map(|(idx, _)| idx)
                    .collect(),
            }
        };

        let mut selected = BTreeSet::new();
        let mut stack = roots;
        while let Some(idx) = stack.pop() {
            if !selected.insert(idx) {
                continue;
            }
            stack.extend(
                self.graph
                    .neighbors_directed(self.nodes[idx], Direction::Incoming)
                    .map(|n| self.graph[n]),
            );
        }

        Ok(selected)
    }

    /// Generate Mermaid diagram of the DAG
    pub fn to_mermaid(&self, pipeline: &Pipeline) -> String {
        let mut out = String::from("graph TD\n");

        for stage in &pipeline.stages {
            out.push_str(&format!(
                "    {}[\"{}\"]\n",
                mermaid_id(&stage.id),
                stage.display_name()
            ));
        }

        for (from, to) in self.edges() {
            out.push_str(&format!("    {} --> {}\n", mermaid_id(from), mermaid_id(to)));
        }

        out
    }

    /// Generate DOT diagram of the DAG
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph pipeline {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for (from, to) in self.edges() {
            out.push_str(&format!("    \"{}\" -> \"{}\";\n", from, to));
        }

        // Add isolated nodes (no edges)
        for node in &self.nodes {
            if self.graph.neighbors_undirected(*node).count() == 0 {
                out.push_str(&format!("    \"{}\";\n", self.index_to_id[node]));
            }
        }

        out.push_str("}\n");
        out
    }

    /// Generate text representation of execution order
    pub fn to_text(&self, pipeline: &Pipeline) -> Result<String, StagehandError> {
        let order = self.topological_order()?;
        let mut out = String::new();

        for (i, idx) in order.iter().enumerate() {
            let stage = &pipeline.stages[*idx];
            let deps = self.dependencies(&stage.id).unwrap_or_default();

            out.push_str(&format!("{}. {}", i + 1, stage.id));
            if !stage.requirements.is_empty() {
                out.push_str(&format!(" on [{}]", stage.requirements.join(", ")));
            }
            if !deps.is_empty() {
                out.push_str(&format!(" [depends: {}]", deps.join(", ")));
            }

            out.push('\n');
        }

        Ok(out)
    }

    fn edges(&self) -> Vec<(&str, &str)> {
        let mut edges: Vec<(usize, usize)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(from, to)| (self.graph[from], self.graph[to]))
            .collect();
        edges.sort();
        edges
            .into_iter()
            .map(|(from, to)| {
                (
                    self.index_to_id[&self.nodes[from]].as_str(),
                    self.index_to_id[&self.nodes[to]].as_str(),
                )
            })
            .collect()
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn mermaid_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_pipeline(stages: Vec<(&str, Vec<&str>)>) -> Pipeline {
        let mut yaml = String::from("id: test\nstages:\n");
        for (id, deps) in stages {
            yaml.push_str(&format!("  - id: {}\n    steps: []\n", id));
            if !deps.is_empty() {
                yaml.push_str("    dependencies:\n");
                for dep in deps {
                    yaml.push_str(&format!("      - stage: {}\n", dep));
                }
            }
        }
        Pipeline::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_linear_dag() {
        let pipeline = make_test_pipeline(vec![
            ("a", vec![]),
            ("b", vec!["a"]),
            ("c", vec!["b"]),
        ]);

        let dag = DagBuilder::build(&pipeline).unwrap();
        let order = dag.topological_order_ids().unwrap();

        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let pipeline = make_test_pipeline(vec![
            ("d", vec!["b", "c"]),
            ("c", vec!["a"]),
            ("b", vec!["a"]),
            ("a", vec![]),
        ]);

        let dag = DagBuilder::build(&pipeline).unwrap();
        assert_eq!(dag.topological_order_ids().unwrap(), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn test_circular_dependency_detection() {
        let pipeline = make_test_pipeline(vec![
            ("a", vec!["c"]),
            ("b", vec!["a"]),
            ("c", vec!["b"]),
            ("d", vec![]),
        ]);

        let result = DagBuilder::build(&pipeline);
        let Err(StagehandError::CircularDependency { stages }) = result else {
            panic!("expected a cycle");
        };
        assert!(stages.len() >= 3);
        assert!(!stages.contains(&"d".to_string()));
    }

    #[test]
    fn test_unknown_dependency() {
        let pipeline = make_test_pipeline(vec![("a", vec!["nonexistent"])]);

        let result = DagBuilder::build(&pipeline);
        assert!(matches!(
            result,
            Err(StagehandError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_depends_on_check() {
        let pipeline = make_test_pipeline(vec![
            ("a", vec![]),
            ("b", vec!["a"]),
            ("c", vec!["b"]),
        ]);

        let dag = DagBuilder::build(&pipeline).unwrap();

        assert!(dag.depends_on("c", "a")); // transitive
        assert!(dag.depends_on("c", "b")); // direct
        assert!(!dag.depends_on("a", "c")); // reverse
        assert!(!dag.depends_on("a", "a"));
        assert_eq!(dag.dependents("a").unwrap(), vec!["b"]);
    }

    #[test]
    fn test_select_adds_transitive_upstreams() {
        let pipeline = make_test_pipeline(vec![
            ("a", vec![]),
            ("b", vec!["a"]),
            ("c", vec!["b"]),
            ("other", vec![]),
        ]);
        let dag = DagBuilder::build(&pipeline).unwrap();

        let selected = dag
            .select(&pipeline, &TriggerEvent::Manual, &["c".to_string()])
            .unwrap();
        assert_eq!(selected, BTreeSet::from([0, 1, 2]));

        let err = dag
            .select(&pipeline, &TriggerEvent::Manual, &["zzz".to_string()])
            .unwrap_err();
        assert!(matches!(err, StagehandError::StageNotFound { .. }));
    }

    #[test]
    fn test_select_by_change_event() {
        let pipeline =
            Pipeline::from_yaml(include_str!("../../pipelines/unity-ios.yaml")).unwrap();
        let dag = DagBuilder::build(&pipeline).unwrap();

        let change = |path: &str| TriggerEvent::Change {
            paths: vec![path.to_string()],
        };

        let selected = dag.select(&pipeline, &change("fastlane/Fastfile"), &[]).unwrap();
        assert_eq!(selected, BTreeSet::from([0, 1]));

        let selected = dag.select(&pipeline, &change("README.md"), &[]).unwrap();
        assert!(selected.is_empty());
    }

    #[test]
    fn test_mermaid_output() {
        let pipeline = make_test_pipeline(vec![("build-a", vec![]), ("b", vec!["build-a"])]);

        let dag = DagBuilder::build(&pipeline).unwrap();
        let mermaid = dag.to_mermaid(&pipeline);

        assert!(mermaid.contains("graph TD"));
        assert!(mermaid.contains("build_a --> b"));
        assert!(dag.to_dot().contains("\"build-a\" -> \"b\""));
    }
}
