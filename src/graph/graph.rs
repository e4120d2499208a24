// src/graph/graph.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::model::Step;
use crate::errors::{CrondagError, Result};
use crate::graph::node::{Node, NodeData, NodeState};

/// The nodes of one run plus their dependency edges.
///
/// Nodes live in an arena (`Vec`) and edges are integer indices resolved
/// through a name→index map; construction fails on duplicate names, unknown
/// dependencies and cycles. Exclusively owned by one agent for one run.
#[derive(Debug)]
pub struct ExecutionGraph {
    nodes: Vec<Arc<Node>>,
    index: HashMap<String, usize>,
    deps: Vec<Vec<usize>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl ExecutionGraph {
    /// Build a fresh graph from the DAG's steps.
    pub fn new(steps: &[Step]) -> Result<Self> {
        Self::from_nodes(steps.iter().cloned().map(Node::new).collect())
    }

    /// Build a graph seeded with a previous run's node data.
    ///
    /// Nodes that succeeded keep their state (and published outputs); all
    /// others are reset so only unfinished work is re-executed.
    pub fn for_retry(seed: Vec<(Step, NodeData)>) -> Result<Self> {
        let nodes = seed
            .into_iter()
            .map(|(step, mut data)| {
                if data.state != NodeState::Success {
                    data = NodeData {
                        outputs: data.outputs,
                        log_file: data.log_file,
                        ..NodeData::default()
                    };
                }
                Node::with_data(step, data)
            })
            .collect();
        Self::from_nodes(nodes)
    }

    fn from_nodes(nodes: Vec<Node>) -> Result<Self> {
        let nodes: Vec<Arc<Node>> = nodes.into_iter().map(Arc::new).collect();

        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.name().to_string(), i).is_some() {
                return Err(CrondagError::Definition(format!(
                    "duplicate step name '{}'",
                    node.name()
                )));
            }
        }

        let mut deps = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let mut node_deps = Vec::new();
            for dep in &node.step().depends {
                let Some(&di) = index.get(dep.as_str()) else {
                    return Err(CrondagError::Definition(format!(
                        "step '{}' has unknown dependency '{}'",
                        node.name(),
                        dep
                    )));
                };
                node_deps.push(di);
            }
            deps.push(node_deps);
        }

        validate_acyclic(&nodes, &deps)?;

        Ok(Self {
            nodes,
            index,
            deps,
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
        })
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Arc<Node>> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Dependency indices of node `i`, in declaration order.
    pub fn deps_of(&self, i: usize) -> &[usize] {
        &self.deps[i]
    }

    pub fn mark_started(&self) {
        let mut started = self.started_at.lock().unwrap();
        if started.is_none() {
            *started = Some(Utc::now());
        }
    }

    /// Record the finish time. Only meaningful once every node is terminal.
    pub fn mark_finished(&self) {
        let mut finished = self.finished_at.lock().unwrap();
        if finished.is_none() {
            *finished = Some(Utc::now());
        }
    }

    pub fn start_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap()
    }

    pub fn finish_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.lock().unwrap()
    }

    pub fn is_started(&self) -> bool {
        self.start_at().is_some() || self.nodes.iter().any(|n| n.state() != NodeState::None)
    }

    /// All nodes are in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.nodes.iter().all(|n| n.state().is_terminal())
    }

    pub fn is_running(&self) -> bool {
        self.nodes.iter().any(|n| n.state() == NodeState::Running)
    }
}

fn validate_acyclic(nodes: &[Arc<Node>], deps: &[Vec<usize>]) -> Result<()> {
    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for i in 0..nodes.len() {
        graph.add_node(i);
    }
    for (i, node_deps) in deps.iter().enumerate() {
        for &d in node_deps {
            graph.add_edge(d, i, ());
        }
    }
    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => Err(CrondagError::DependencyCycle(format!(
            "cycle involving step '{}'",
            nodes[cycle.node_id()].name()
        ))),
    }
}
