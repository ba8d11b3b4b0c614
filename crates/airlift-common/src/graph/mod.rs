//! Dependency ordering for release graphs
//!
//! Computes the order in which releases must be deployed so every release
//! comes after everything it depends on. The walk is a depth-first search in
//! input order, which keeps the output stable for a fixed input: nodes with
//! no ordering constraint between them keep their relative input order.
//!
//! A node that is reached again while still on the DFS stack means the graph
//! has a cycle. That is reported as [`GraphError::Cycle`] with the offending
//! path instead of recursing forever.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::warn;

/// Errors from dependency ordering
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The dependency graph contains a cycle
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Node ids along the cycle, first and last entries are the same node
        path: Vec<String>,
    },
}

/// A node in the dependency graph
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyNode {
    /// Unique node id (for releases: `namespace/name`)
    pub id: String,
    /// Ids this node depends on
    pub depends_on: Vec<String>,
}

impl DependencyNode {
    /// Create a node from an id and its dependencies
    pub fn new<I, S>(id: impl Into<String>, depends_on: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            depends_on: depends_on.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

struct Walk<'a> {
    edges: HashMap<&'a str, &'a [String]>,
    marks: HashMap<&'a str, Mark>,
    stack: Vec<&'a str>,
    order: Vec<String>,
}

impl<'a> Walk<'a> {
    fn visit(&mut self, id: &'a str) -> Result<(), GraphError> {
        match self.marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                let start = self.stack.iter().position(|n| *n == id).unwrap_or(0);
                let mut path: Vec<String> =
                    self.stack[start..].iter().map(|n| n.to_string()).collect();
                path.push(id.to_string());
                return Err(GraphError::Cycle { path });
            }
            None => {}
        }

        self.marks.insert(id, Mark::InProgress);
        self.stack.push(id);

        let deps = self.edges.get(id).copied().unwrap_or_default();
        for dep in deps {
            if !self.edges.contains_key(dep.as_str()) {
                warn!(node = %id, dependency = %dep, "skipping dependency on unknown node");
                continue;
            }
            self.visit(dep.as_str())?;
        }

        self.stack.pop();
        self.marks.insert(id, Mark::Done);
        self.order.push(id.to_string());
        Ok(())
    }
}

/// Order nodes so that every node follows all of its dependencies.
///
/// Dependencies naming ids that are not in `nodes` are skipped, so the output
/// always holds each input id exactly once. When an id appears twice, the
/// first occurrence's dependencies are used.
pub fn sort_dependencies(nodes: &[DependencyNode]) -> Result<Vec<String>, GraphError> {
    let mut edges: HashMap<&str, &[String]> = HashMap::with_capacity(nodes.len());
    let mut input_order = Vec::with_capacity(nodes.len());
    for node in nodes {
        if edges.contains_key(node.id.as_str()) {
            warn!(node = %node.id, "duplicate node id, keeping first occurrence");
            continue;
        }
        edges.insert(&node.id, &node.depends_on);
        input_order.push(node.id.as_str());
    }

    let mut walk = Walk {
        edges,
        marks: HashMap::with_capacity(input_order.len()),
        stack: Vec::new(),
        order: Vec::with_capacity(input_order.len()),
    };
    for id in input_order {
        walk.visit(id)?;
    }
    Ok(walk.order)
}

/// [`sort_dependencies`] over a `node -> dependencies` map
///
/// Iteration follows the map's key order, so the result is deterministic.
pub fn sort_map(graph: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>, GraphError> {
    let nodes: Vec<DependencyNode> = graph
        .iter()
        .map(|(id, deps)| DependencyNode::new(id.clone(), deps.iter().cloned()))
        .collect();
    sort_dependencies(&nodes)
}
