// src/dag/loader.rs

use std::fs;
use std::path::Path;

use crate::dag::model::{Dag, RawDag};
use crate::dag::validate::validate_dag;
use crate::errors::Result;

/// Load and validate a DAG definition from a YAML file.
///
/// This is the entry point used by anything that is going to *run* the DAG:
/// it parses the YAML, builds the typed model (parsing cron expressions on
/// the way), then checks step references and acyclicity.
pub fn load_dag(path: impl AsRef<Path>) -> Result<Dag> {
    let path = path.as_ref();
    let raw = read_raw(path)?;
    let dag = Dag::build(raw, path)?;
    validate_dag(&dag)?;
    Ok(dag)
}

/// Load a DAG header only, skipping step validation.
///
/// The entry reader keeps one of these per file in the DAGs directory; it
/// needs the name, schedules and flags but never executes steps from it.
pub fn load_metadata(path: impl AsRef<Path>) -> Result<Dag> {
    let path = path.as_ref();
    let raw = read_raw(path)?;
    Dag::build(raw, path)
}

/// Load a DAG and replace its default params with the given override.
///
/// An empty override keeps the params from the definition file.
pub fn load_dag_with_params(path: impl AsRef<Path>, params: &[String]) -> Result<Dag> {
    let mut dag = load_dag(path)?;
    if !params.is_empty() {
        dag.params = params.to_vec();
    }
    Ok(dag)
}

fn read_raw(path: &Path) -> Result<RawDag> {
    let contents = fs::read_to_string(path)?;
    let raw: RawDag = serde_yaml::from_str(&contents)?;
    Ok(raw)
}

/// Whether a directory entry looks like a DAG definition file.
pub fn is_yaml_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
