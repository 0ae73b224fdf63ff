//! DAG validation and the immutable `Graph` model.
//!
//! Generalises the teacher's edge-list `validate_dag` to the
//! dependency-set form: each node carries `dependencies: Vec<String>`
//! rather than a separate edge list. Validation order is duplicate ids,
//! then unknown references, then the empty-root check, then cycle
//! detection — each a distinct `GraphError` variant naming the
//! offending id. Kahn's algorithm stays iterative (FIFO queue, never
//! recursive) so deep graphs don't blow the stack.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::model::WorkflowDefinition;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate node id: '{0}'")]
    DuplicateId(String),

    #[error("node '{node_id}' depends on unknown node '{dependency}'")]
    UnknownReference { node_id: String, dependency: String },

    #[error("DAG has no root node (every node has at least one dependency)")]
    EmptyRoot,

    #[error("cycle detected involving node '{0}'")]
    CycleDetected(String),
}

/// A validated, immutable DAG: topological order plus adjacency queries.
#[derive(Debug, Clone)]
pub struct Graph {
    order: Vec<String>,
    children: HashMap<String, Vec<String>>,
    parents: HashMap<String, Vec<String>>,
    roots: Vec<String>,
    ids: HashSet<String>,
}

impl Graph {
    /// Validate `workflow` and build its `Graph`.
    pub fn validate(workflow: &WorkflowDefinition) -> Result<Graph, GraphError> {
        // 1. Unique ids.
        let mut ids: HashSet<String> = HashSet::new();
        for node in &workflow.nodes {
            if !ids.insert(node.id.clone()) {
                return Err(GraphError::DuplicateId(node.id.clone()));
            }
        }

        // 2. Every dependency must reference a known id.
        for node in &workflow.nodes {
            for dep in &node.dependencies {
                if !ids.contains(dep) {
                    return Err(GraphError::UnknownReference {
                        node_id: node.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // 3. At least one node (an empty DAG has no root by construction;
        // a non-empty one always has a root unless every node sits on a
        // cycle, which step 4's Kahn's algorithm below catches instead).
        if workflow.nodes.is_empty() {
            return Err(GraphError::EmptyRoot);
        }

        let mut parents: HashMap<String, Vec<String>> = HashMap::new();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut in_degree: HashMap<String, usize> = HashMap::new();

        for node in &workflow.nodes {
            children.entry(node.id.clone()).or_default();
            parents.entry(node.id.clone()).or_default();
            in_degree.entry(node.id.clone()).or_insert(0);
        }

        for node in &workflow.nodes {
            for dep in &node.dependencies {
                children.entry(dep.clone()).or_default().push(node.id.clone());
                parents.entry(node.id.clone()).or_default().push(dep.clone());
                *in_degree.entry(node.id.clone()).or_insert(0) += 1;
            }
        }

        // A non-empty DAG with zero in-degree-0 nodes is necessarily a
        // cycle spanning every node; Kahn's algorithm below reports that
        // as `CycleDetected`, so no separate check is needed here.
        let roots: Vec<String> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| id.clone())
            .collect();

        // 4. Kahn's algorithm — iterative topological sort.
        let mut queue: VecDeque<String> = roots.iter().cloned().collect();
        let mut order: Vec<String> = Vec::with_capacity(workflow.nodes.len());

        while let Some(node_id) = queue.pop_front() {
            order.push(node_id.clone());
            if let Some(kids) = children.get(&node_id) {
                for child in kids {
                    let deg = in_degree.get_mut(child).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(child.clone());
                    }
                }
            }
        }

        if order.len() != workflow.nodes.len() {
            let stuck = in_degree
                .into_iter()
                .find(|(_, d)| *d > 0)
                .map(|(id, _)| id)
                .unwrap_or_default();
            return Err(GraphError::CycleDetected(stuck));
        }

        Ok(Graph {
            order,
            children,
            parents,
            roots,
            ids,
        })
    }

    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn children(&self, node_id: &str) -> &[String] {
        self.children.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parents(&self, node_id: &str) -> &[String] {
        self.parents.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.ids.contains(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeDefinition;

    fn node(id: &str, deps: &[&str]) -> NodeDefinition {
        NodeDefinition {
            id: id.to_string(),
            handler: "mock".into(),
            config: serde_json::Value::Null,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn workflow(nodes: Vec<NodeDefinition>) -> WorkflowDefinition {
        WorkflowDefinition::new("test", nodes)
    }

    #[test]
    fn linear_chain_sorts_in_order() {
        let wf = workflow(vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])]);
        let graph = Graph::validate(&wf).expect("should be valid");
        assert_eq!(graph.topological_order(), ["a", "b", "c"]);
        assert_eq!(graph.roots(), ["a"]);
        assert_eq!(graph.children("a"), ["b"]);
        assert_eq!(graph.parents("c"), ["b"]);
    }

    #[test]
    fn diamond_dag_is_valid() {
        let wf = workflow(vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("d", &["b", "c"]),
        ]);
        let graph = Graph::validate(&wf).expect("should be valid");
        assert_eq!(graph.topological_order().first().unwrap(), "a");
        assert_eq!(graph.topological_order().last().unwrap(), "d");
        assert_eq!(graph.topological_order().len(), 4);
        let mut parents = graph.parents("d").to_vec();
        parents.sort();
        assert_eq!(parents, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let wf = workflow(vec![node("a", &[]), node("a", &[])]);
        assert_eq!(Graph::validate(&wf).unwrap_err(), GraphError::DuplicateId("a".into()));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let wf = workflow(vec![node("a", &["ghost"])]);
        assert_eq!(
            Graph::validate(&wf).unwrap_err(),
            GraphError::UnknownReference {
                node_id: "a".into(),
                dependency: "ghost".into(),
            }
        );
    }

    #[test]
    fn cycle_is_detected() {
        let wf = workflow(vec![node("a", &["b"]), node("b", &["a"])]);
        assert!(matches!(Graph::validate(&wf), Err(GraphError::CycleDetected(_))));
    }

    #[test]
    fn single_node_no_deps_is_valid() {
        let wf = workflow(vec![node("solo", &[])]);
        let graph = Graph::validate(&wf).expect("single node should be valid");
        assert_eq!(graph.topological_order(), ["solo"]);
    }

    #[test]
    fn empty_dag_is_rejected() {
        let wf = workflow(vec![]);
        assert_eq!(Graph::validate(&wf).unwrap_err(), GraphError::EmptyRoot);
    }
}
