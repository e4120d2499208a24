// src/exec/condition.rs

use std::collections::HashMap;

use tracing::debug;

use crate::dag::model::Precondition;
use crate::errors::{CrondagError, Result};
use crate::exec::command::{expand_env, substitute_commands};

/// Evaluate a single precondition.
///
/// The `condition` string is expanded (env vars, then backticks) and the
/// result compared to `expected`. A mismatch is an error carrying both
/// sides, so the skip reason shows up in logs and status.
pub fn eval_condition(cond: &Precondition, env: &HashMap<String, String>) -> Result<()> {
    let actual = substitute_commands(&expand_env(&cond.condition, env))?;
    let actual = actual.trim();

    if actual == cond.expected {
        debug!(condition = %cond.condition, value = %actual, "precondition met");
        Ok(())
    } else {
        Err(CrondagError::PreconditionFailed {
            expected: cond.expected.clone(),
            actual: actual.to_string(),
        })
    }
}

/// Evaluate preconditions in order, failing on the first mismatch.
pub fn eval_conditions(conds: &[Precondition], env: &HashMap<String, String>) -> Result<()> {
    for cond in conds {
        eval_condition(cond, env)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(condition: &str, expected: &str) -> Precondition {
        Precondition {
            condition: condition.to_string(),
            expected: expected.to_string(),
        }
    }

    #[test]
    fn matching_condition_passes() {
        eval_condition(&cond("`echo 1`", "1"), &HashMap::new()).unwrap();
    }

    #[test]
    fn mismatch_reports_both_sides() {
        let err = eval_condition(&cond("`echo 1`", "0"), &HashMap::new()).unwrap_err();
        match err {
            CrondagError::PreconditionFailed { expected, actual } => {
                assert_eq!(expected, "0");
                assert_eq!(actual, "1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn env_vars_participate() {
        let mut env = HashMap::new();
        env.insert("STAGE".to_string(), "prod".to_string());
        eval_condition(&cond("${STAGE}", "prod"), &env).unwrap();
    }
}
