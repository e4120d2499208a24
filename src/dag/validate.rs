// src/dag/validate.rs

use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::model::Dag;
use crate::errors::{CrondagError, Result};

/// Structural validation of a built [`Dag`]:
/// - at least one step
/// - unique step names
/// - `depends` references resolve and are not self-references
/// - the dependency graph is acyclic
pub fn validate_dag(dag: &Dag) -> Result<()> {
    ensure_has_steps(dag)?;
    ensure_unique_names(dag)?;
    validate_depends(dag)?;
    validate_acyclic(dag)?;
    Ok(())
}

fn ensure_has_steps(dag: &Dag) -> Result<()> {
    if dag.steps.is_empty() {
        return Err(CrondagError::Definition(format!(
            "DAG '{}' must contain at least one step",
            dag.name
        )));
    }
    Ok(())
}

fn ensure_unique_names(dag: &Dag) -> Result<()> {
    let mut seen = HashSet::new();
    for step in &dag.steps {
        if step.name.trim().is_empty() {
            return Err(CrondagError::Definition(format!(
                "DAG '{}' has a step with an empty name",
                dag.name
            )));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(CrondagError::Definition(format!(
                "duplicate step name '{}' in DAG '{}'",
                step.name, dag.name
            )));
        }
    }
    Ok(())
}

fn validate_depends(dag: &Dag) -> Result<()> {
    let names: HashSet<&str> = dag.steps.iter().map(|s| s.name.as_str()).collect();
    for step in &dag.steps {
        for dep in &step.depends {
            if !names.contains(dep.as_str()) {
                return Err(CrondagError::Definition(format!(
                    "step '{}' has unknown dependency '{}'",
                    step.name, dep
                )));
            }
            if dep == &step.name {
                return Err(CrondagError::Definition(format!(
                    "step '{}' cannot depend on itself",
                    step.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_acyclic(dag: &Dag) -> Result<()> {
    // Edge direction: dep -> step. A topological sort fails on a cycle.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for step in &dag.steps {
        graph.add_node(step.name.as_str());
    }
    for step in &dag.steps {
        for dep in &step.depends {
            graph.add_edge(dep.as_str(), step.name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(CrondagError::DependencyCycle(format!(
            "cycle involving step '{}'",
            cycle.node_id()
        ))),
    }
}
