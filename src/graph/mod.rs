// src/graph/mod.rs

//! Runtime execution: nodes, the execution graph, and the scheduler that
//! drives a graph to completion.
//!
//! A [`Node`] is one step instance with its own state machine and process
//! handle. The [`ExecutionGraph`] owns the nodes of one run and answers
//! readiness queries. The [`GraphScheduler`] admits ready nodes up to the
//! concurrency limit, reacts to completions over a channel, cascades
//! failures, and runs lifecycle handlers once the graph is terminal.

pub mod graph;
pub mod node;
pub mod scheduler;

pub use graph::ExecutionGraph;
pub use node::{ExecContext, Node, NodeData, NodeState};
pub use scheduler::{GraphScheduler, HandlerType, RunStatus, SchedulerConfig};
