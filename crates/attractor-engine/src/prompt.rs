use crate::graph::{AttrValue, Graph, split_list};
use crate::validate::Diagnostic;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming extra `/command` search directories
/// (comma-separated).
pub const COMMAND_PATH_ENV: &str = "ATTRACTOR_COMMAND_PATH";
const COMMAND_DIR: &str = ".attractor/commands";

#[derive(Clone, Debug, Default)]
pub struct PromptOptions {
    /// Directory of the graph source file; `@file` paths resolve against it.
    pub source_dir: Option<PathBuf>,
    /// Home directory override; defaults to `$HOME`.
    pub home_dir: Option<PathBuf>,
    /// Extra `/command` search dirs; defaults to `ATTRACTOR_COMMAND_PATH`.
    pub extra_command_dirs: Vec<PathBuf>,
    /// Runtime variable overrides (`--set key=value`).
    pub overrides: BTreeMap<String, String>,
}

impl PromptOptions {
    pub fn for_source(path: &Path) -> Self {
        Self {
            source_dir: path.parent().map(Path::to_path_buf),
            ..Self::default()
        }
    }
}

/// Resolves `@file` and `/command` prompt references and expands
/// `$identifier` variables in node prompts and labels. Failures come back as
/// validation diagnostics rather than hard errors so the caller can report
/// them alongside the structural rules.
pub fn resolve_prompts(graph: &mut Graph, options: &PromptOptions) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let declared = declared_vars(graph);
    let vars_declared = graph.attrs.get("vars").is_some();
    let mut bindings: BTreeMap<String, String> = declared
        .iter()
        .filter_map(|(name, default)| {
            default.clone().map(|value| (name.clone(), value))
        })
        .collect();
    bindings.insert("goal".to_string(), graph.goal().to_string());
    for (name, value) in &options.overrides {
        bindings.insert(name.clone(), value.clone());
    }

    let node_ids: Vec<String> = graph.nodes.keys().cloned().collect();
    for node_id in node_ids {
        let prompt = graph
            .nodes
            .get(&node_id)
            .map(|node| node.prompt().to_string())
            .unwrap_or_default();

        let mut node_bindings = bindings.clone();
        let resolved = match resolve_reference(&prompt, options, &mut node_bindings) {
            Ok(resolved) => resolved,
            Err(message) => {
                diagnostics.push(
                    Diagnostic::error("prompt_reference", message).at_node(node_id.clone()),
                );
                continue;
            }
        };

        let expanded = expand_vars(
            &resolved,
            &node_bindings,
            vars_declared,
            &declared,
            &node_id,
            &mut diagnostics,
        );
        let node = graph.nodes.get_mut(&node_id).expect("node id came from graph");
        if expanded != prompt {
            node.attrs.set_explicit("prompt", AttrValue::String(expanded));
        }

        let label = node.attrs.get_str("label").map(ToOwned::to_owned);
        if let Some(label) = label {
            let expanded_label = expand_vars(
                &label,
                &node_bindings,
                vars_declared,
                &declared,
                &node_id,
                &mut diagnostics,
            );
            if expanded_label != label {
                node.attrs
                    .set_explicit("label", AttrValue::String(expanded_label));
            }
        }
    }

    diagnostics
}

/// Graph `vars` declarations: comma list of `name` or `name=default`.
fn declared_vars(graph: &Graph) -> BTreeMap<String, Option<String>> {
    split_list(graph.attrs.get_str("vars").unwrap_or_default())
        .into_iter()
        .map(|entry| match entry.split_once('=') {
            Some((name, default)) => (name.trim().to_string(), Some(default.trim().to_string())),
            None => (entry, None),
        })
        .collect()
}

fn resolve_reference(
    prompt: &str,
    options: &PromptOptions,
    bindings: &mut BTreeMap<String, String>,
) -> Result<String, String> {
    if let Some(relative) = prompt.strip_prefix('@') {
        let Some(base) = options.source_dir.as_deref() else {
            return Err(format!(
                "prompt file '@{relative}' cannot resolve without a source directory"
            ));
        };
        let path = base.join(relative.trim());
        return fs::read_to_string(&path)
            .map_err(|error| format!("prompt file '{}' unreadable: {error}", path.display()));
    }

    if let Some(invocation) = prompt.strip_prefix('/') {
        let mut parts = invocation.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err("command prompt has no command name".to_string());
        }
        let arguments = parts.next().unwrap_or_default().trim();
        bindings.insert("ARGUMENTS".to_string(), arguments.to_string());

        let file_name = format!("{}.md", name.replace(':', "/"));
        for dir in command_search_dirs(options) {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                return fs::read_to_string(&candidate).map_err(|error| {
                    format!("command file '{}' unreadable: {error}", candidate.display())
                });
            }
        }
        return Err(format!("command '/{name}' not found on the search path"));
    }

    Ok(prompt.to_string())
}

/// Search order: dot-file dir, `{project}/.attractor/commands/`, dirs from
/// the env comma-list, `~/.attractor/commands/`, the same extra dirs under
/// the home directory.
fn command_search_dirs(options: &PromptOptions) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(source_dir) = options.source_dir.as_deref() {
        dirs.push(source_dir.to_path_buf());
        dirs.push(source_dir.join(COMMAND_DIR));
    }

    let extra: Vec<PathBuf> = if options.extra_command_dirs.is_empty() {
        std::env::var(COMMAND_PATH_ENV)
            .map(|raw| split_list(&raw).into_iter().map(PathBuf::from).collect())
            .unwrap_or_default()
    } else {
        options.extra_command_dirs.clone()
    };
    dirs.extend(extra.iter().cloned());

    let home = options
        .home_dir
        .clone()
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from));
    if let Some(home) = home {
        dirs.push(home.join(COMMAND_DIR));
        for dir in &extra {
            if dir.is_relative() {
                dirs.push(home.join(dir));
            }
        }
    }
    dirs
}

fn expand_vars(
    input: &str,
    bindings: &BTreeMap<String, String>,
    vars_declared: bool,
    declared: &BTreeMap<String, Option<String>>,
    node_id: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((index, ch)) = chars.next() {
        if ch != '$' {
            output.push(ch);
            continue;
        }
        let start = index + ch.len_utf8();
        let mut end = start;
        while let Some((next_index, next_ch)) = chars.peek().copied() {
            let acceptable = if end == start {
                next_ch.is_ascii_alphabetic() || next_ch == '_'
            } else {
                next_ch.is_ascii_alphanumeric() || next_ch == '_'
            };
            if !acceptable {
                break;
            }
            end = next_index + next_ch.len_utf8();
            chars.next();
        }
        if end == start {
            output.push('$');
            continue;
        }
        let name = &input[start..end];

        if let Some(value) = bindings.get(name) {
            output.push_str(value);
        } else if vars_declared
            && !declared.contains_key(name)
            && name != "goal"
            && name != "ARGUMENTS"
        {
            diagnostics.push(
                Diagnostic::error(
                    "undeclared_variable",
                    format!("variable '${name}' is not declared in graph vars"),
                )
                .at_node(node_id.to_string()),
            );
            output.push('$');
            output.push_str(name);
        } else {
            // Declared without default and not overridden, or free-form
            // graph: the reference stays literal.
            output.push('$');
            output.push_str(name);
        }
    }
    output
}
