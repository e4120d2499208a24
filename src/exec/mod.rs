// src/exec/mod.rs

//! Command-line expansion and evaluation.
//!
//! Everything a step's command goes through before a process is spawned
//! lives here: environment expansion, backtick substitution, shell-word
//! tokenization with pipeline splitting, and precondition evaluation.

pub mod command;
pub mod condition;

pub use command::{
    expand_env, shell_command, split_command_with_eval, split_piped_command, substitute_commands,
};
pub use condition::eval_conditions;
