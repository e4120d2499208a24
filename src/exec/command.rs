// src/exec/command.rs

use std::collections::HashMap;
use std::process::Command;

use tracing::debug;

use crate::errors::{CrondagError, Result};

/// Split a shell-style command string into a pipeline.
///
/// Each inner `Vec` is one command's words. Unquoted `|` is the pipeline
/// boundary; double quotes, backticks and backslash escapes are honored.
/// Double quotes are stripped from the resulting words, backtick spans are
/// kept intact (substitution runs before tokenization).
///
/// ```text
/// echo foo | wc -l        => [[echo, foo], [wc, -l]]
/// echo "hello|world"      => [[echo, hello|world]]
/// ```
pub fn split_piped_command(input: &str) -> Vec<Vec<String>> {
    let mut in_quote = false;
    let mut in_backtick = false;
    let mut in_escape = false;
    let mut current = String::new();
    let mut words: Vec<String> = Vec::new();
    let mut pipeline: Vec<Vec<String>> = Vec::new();

    fn flush_word(current: &mut String, words: &mut Vec<String>) {
        if !current.is_empty() {
            words.push(std::mem::take(current));
        }
    }

    for c in input.chars() {
        match c {
            _ if in_escape => {
                current.push(c);
                in_escape = false;
            }
            '\\' => {
                in_escape = true;
            }
            '"' if !in_backtick => {
                in_quote = !in_quote;
            }
            '`' => {
                current.push(c);
                in_backtick = !in_backtick;
            }
            '|' if !in_quote && !in_backtick => {
                flush_word(&mut current, &mut words);
                if !words.is_empty() {
                    pipeline.push(std::mem::take(&mut words));
                }
            }
            c if c.is_whitespace() && !in_quote && !in_backtick => {
                flush_word(&mut current, &mut words);
            }
            _ => current.push(c),
        }
    }

    flush_word(&mut current, &mut words);
    if !words.is_empty() {
        pipeline.push(words);
    }

    pipeline
}

/// Expand `$VAR` / `${VAR}` in `input`.
///
/// `extra` is consulted before the process environment, so step outputs and
/// positional params shadow inherited variables. Unknown variables expand to
/// the empty string.
pub fn expand_env(input: &str, extra: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                out.push_str(&lookup(&name, extra));
            }
            Some(c) if c.is_ascii_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name, extra));
            }
            _ => out.push('$'),
        }
    }

    out
}

fn lookup(name: &str, extra: &HashMap<String, String>) -> String {
    if let Some(v) = extra.get(name) {
        return v.clone();
    }
    std::env::var(name).unwrap_or_default()
}

/// Substitute backticked subcommands with their captured stdout.
///
/// Each `` `cmd` `` span is run through the shell; trailing newlines are
/// trimmed from the output before substitution. Blocking; wrap in
/// `spawn_blocking` when called from the runtime.
pub fn substitute_commands(input: &str) -> Result<String> {
    if !input.contains('`') {
        return Ok(input.to_string());
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('`') {
        let Some(len) = rest[start + 1..].find('`') else {
            // Unbalanced backtick; keep the remainder as-is.
            out.push_str(rest);
            return Ok(out);
        };
        out.push_str(&rest[..start]);

        let body = &rest[start + 1..start + 1 + len];
        debug!(command = %body, "substituting backtick command");
        out.push_str(run_captured(body)?.trim_end_matches('\n'));

        rest = &rest[start + len + 2..];
    }
    out.push_str(rest);

    Ok(out)
}

fn run_captured(body: &str) -> Result<String> {
    let shell = shell_command(None).unwrap_or_else(|| "sh".to_string());
    let output = Command::new(shell)
        .arg("-c")
        .arg(body)
        .output()
        .map_err(|e| CrondagError::CommandBadShape(format!("`{body}`: {e}")))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Expand and tokenize a command string into `(program, args)`.
///
/// Environment expansion and backtick substitution are applied to every
/// word in every pipeline segment. When the pipeline has more than one
/// segment, the remaining segments are appended as a literal `|` followed
/// by their words, for execution through a shell.
pub fn split_command_with_eval(
    cmd: &str,
    env: &HashMap<String, String>,
) -> Result<(String, Vec<String>)> {
    let expanded = substitute_commands(&expand_env(cmd, env))?;
    let pipeline = split_piped_command(&expanded);
    flatten_pipeline(pipeline)
}

/// Tokenize without any expansion.
pub fn split_command(cmd: &str) -> Result<(String, Vec<String>)> {
    flatten_pipeline(split_piped_command(cmd))
}

fn flatten_pipeline(pipeline: Vec<Vec<String>>) -> Result<(String, Vec<String>)> {
    let mut segments = pipeline.into_iter();
    let Some(first) = segments.next() else {
        return Err(CrondagError::CommandEmpty);
    };
    let Some((program, rest)) = first.split_first() else {
        return Err(CrondagError::CommandEmpty);
    };

    let mut args = rest.to_vec();
    for segment in segments {
        args.push("|".to_string());
        args.extend(segment);
    }

    Ok((program.clone(), args))
}

/// The shell used to run command strings: the configured shell if any,
/// then `$SHELL`, then `sh`.
pub fn shell_command(configured: Option<&str>) -> Option<String> {
    if let Some(shell) = configured {
        if !shell.is_empty() {
            return Some(shell.to_string());
        }
    }
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return Some(shell);
        }
    }
    Some("sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_pipeline() {
        let p = split_piped_command("echo foo | grep foo | wc -l");
        assert_eq!(
            p,
            vec![
                vec!["echo".to_string(), "foo".to_string()],
                vec!["grep".to_string(), "foo".to_string()],
                vec!["wc".to_string(), "-l".to_string()],
            ]
        );
    }

    #[test]
    fn quoted_pipe_is_not_a_boundary() {
        let p = split_piped_command(r#"echo "hello|world""#);
        assert_eq!(p, vec![vec!["echo".to_string(), "hello|world".to_string()]]);
    }

    #[test]
    fn backslash_escapes_next_char() {
        let p = split_piped_command(r"echo a\ b");
        assert_eq!(p, vec![vec!["echo".to_string(), "a b".to_string()]]);
    }

    #[test]
    fn backtick_span_stays_in_one_word() {
        let p = split_piped_command("echo `date | head`");
        assert_eq!(
            p,
            vec![vec!["echo".to_string(), "`date | head`".to_string()]]
        );
    }

    #[test]
    fn flatten_keeps_pipe_words() {
        let (cmd, args) = split_command("echo foo | wc -l").unwrap();
        assert_eq!(cmd, "echo");
        assert_eq!(args, vec!["foo", "|", "wc", "-l"]);
    }

    #[test]
    fn empty_command_is_an_error() {
        assert!(matches!(
            split_command("   "),
            Err(CrondagError::CommandEmpty)
        ));
    }

    #[test]
    fn expands_braced_and_bare_vars() {
        let mut extra = HashMap::new();
        extra.insert("NAME".to_string(), "world".to_string());
        assert_eq!(expand_env("hello ${NAME}", &extra), "hello world");
        assert_eq!(expand_env("hello $NAME!", &extra), "hello world!");
        assert_eq!(expand_env("price: 5$", &extra), "price: 5$");
    }

    #[test]
    fn extra_env_shadows_process_env() {
        std::env::set_var("CRONDAG_TEST_SHADOW", "process");
        let mut extra = HashMap::new();
        extra.insert("CRONDAG_TEST_SHADOW".to_string(), "extra".to_string());
        assert_eq!(expand_env("$CRONDAG_TEST_SHADOW", &extra), "extra");
    }

    #[test]
    fn substitutes_backtick_output() {
        let out = substitute_commands("value: `echo 42`").unwrap();
        assert_eq!(out, "value: 42");
    }

    #[test]
    fn eval_applies_env_then_substitution() {
        let mut extra = HashMap::new();
        extra.insert("WORD".to_string(), "hi".to_string());
        let (cmd, args) = split_command_with_eval("echo `echo $WORD`", &extra).unwrap();
        assert_eq!(cmd, "echo");
        assert_eq!(args, vec!["hi"]);
    }
}
