//! `${NAME}` placeholder expansion for server entries.

use crate::core::config::data::{ServerEntry, ServerSpec};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Non-fatal problems found while building a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigWarning {
    /// A placeholder had no value; it was left in place verbatim.
    #[error("Server '{server}' references unset environment variable ${{{variable}}}")]
    EnvVarUnresolved { server: String, variable: String },
}

/// Variables visible to placeholder expansion: the process environment first,
/// then anything the environment file adds on top of it.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    file_vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new(file_vars: BTreeMap<String, String>) -> Self {
        Self { file_vars }
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .or_else(|| self.file_vars.get(name).cloned())
    }

    /// Environment-file variables that the process environment does not
    /// already define. These are what a spawned child needs in addition to
    /// the environment it inherits.
    pub fn additions(&self) -> BTreeMap<String, String> {
        self.file_vars
            .iter()
            .filter(|(key, _)| std::env::var_os(key).is_none())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Expands every placeholder in `value`. Names that do not resolve are pushed
/// onto `unresolved` and kept as written.
pub fn expand(value: &str, env: &Environment, unresolved: &mut Vec<String>) -> String {
    PLACEHOLDER
        .replace_all(value, |caps: &Captures| {
            let name = &caps[1];
            match env.lookup(name) {
                Some(resolved) => resolved,
                None => {
                    if !unresolved.iter().any(|seen| seen == name) {
                        unresolved.push(name.to_string());
                    }
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

/// Builds a `ServerSpec` from a document entry, expanding placeholders in the
/// command, arguments, environment values and working directory.
pub fn resolve_entry(
    name: &str,
    entry: &ServerEntry,
    env: &Environment,
) -> (ServerSpec, Vec<ConfigWarning>) {
    let mut unresolved = Vec::new();
    let command = expand(&entry.command, env, &mut unresolved);
    let args = entry
        .args
        .iter()
        .map(|arg| expand(arg, env, &mut unresolved))
        .collect();
    let spec_env = entry
        .env
        .iter()
        .map(|(key, value)| (key.clone(), expand(value, env, &mut unresolved)))
        .collect();
    let cwd = entry
        .cwd
        .as_deref()
        .map(|cwd| expand(cwd, env, &mut unresolved));

    let warnings = unresolved
        .into_iter()
        .map(|variable| ConfigWarning::EnvVarUnresolved {
            server: name.to_string(),
            variable,
        })
        .collect();

    let spec = ServerSpec {
        name: name.to_string(),
        command,
        args,
        env: spec_env,
        disabled: entry.disabled,
        cwd,
        auto_restart: entry.auto_restart,
    };
    (spec, warnings)
}
