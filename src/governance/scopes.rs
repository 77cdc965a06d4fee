//! Scope derivation from a tool call's name and arguments.

use serde_json::Value;

use crate::registry::ToolRecord;

/// Characters of a command kept in scopes and context keys.
const COMMAND_PREFIX_CHARS: usize = 50;

/// Characters of an argument value kept in approval summaries.
const SUMMARY_VALUE_CHARS: usize = 200;

const FILE_TOOLS: &[&str] = &["write_file", "delete_file", "read_file"];
const DIRECTORY_TOOLS: &[&str] = &["create_directory", "remove_directory", "list_directory"];

fn str_arg<'a>(args: &'a Value, name: &str) -> Option<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn prefix(s: &str, chars: usize) -> String {
    s.chars().take(chars).collect()
}

/// Scopes an approval for this call must select: the registry's base
/// scopes (or `tool:{name}`) plus resource scopes taken from the arguments.
pub fn required_scopes(record: Option<&ToolRecord>, tool: &str, args: &Value) -> Vec<String> {
    let mut scopes = match record {
        Some(r) if !r.required_scopes.is_empty() => r.required_scopes.clone(),
        _ => vec![format!("tool:{tool}")],
    };

    let path_scope = |p: &str| format!("resource:path:{p}");
    match tool {
        "move_file" => {
            scopes.extend(str_arg(args, "source").map(path_scope));
            scopes.extend(str_arg(args, "destination").map(path_scope));
        }
        "execute_command" => {
            if let Some(cmd) = str_arg(args, "command") {
                scopes.push(format!(
                    "resource:command:{}",
                    prefix(cmd, COMMAND_PREFIX_CHARS)
                ));
            }
        }
        t if FILE_TOOLS.contains(&t) || DIRECTORY_TOOLS.contains(&t) => {
            scopes.extend(str_arg(args, "path").map(path_scope));
        }
        _ => {}
    }

    // A resource scope can repeat (move onto itself); the set is what counts.
    let mut seen = std::collections::HashSet::new();
    scopes.retain(|s| seen.insert(s.clone()));
    scopes
}

/// The resource an elevation for this call is bound to.
pub fn context_key(tool: &str, args: &Value) -> String {
    if tool == "move_file" {
        return str_arg(args, "source").unwrap_or("unknown").to_owned();
    }
    if FILE_TOOLS.contains(&tool) || DIRECTORY_TOOLS.contains(&tool) {
        return str_arg(args, "path").unwrap_or("unknown").to_owned();
    }
    if tool == "execute_command" {
        return prefix(
            str_arg(args, "command").unwrap_or("unknown"),
            COMMAND_PREFIX_CHARS,
        );
    }
    if tool.starts_with("git_") {
        return str_arg(args, "cwd").unwrap_or(".").to_owned();
    }
    tool.to_owned()
}

/// One `key: value` line per top-level argument, long values truncated.
pub fn argument_summary(args: &Value) -> String {
    let Some(map) = args.as_object() else {
        return String::new();
    };
    map.iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let shown = if rendered.chars().count() > SUMMARY_VALUE_CHARS {
                format!("{}...", prefix(&rendered, SUMMARY_VALUE_CHARS))
            } else {
                rendered
            };
            format!("{key}: {shown}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
