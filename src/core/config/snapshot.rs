use crate::core::config::data::{ConfigDocument, ServerSpec, SupervisorSettings};
use crate::core::config::io::{self, ConfigError};
use crate::core::config::substitute::{resolve_entry, ConfigWarning, Environment};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::warn;

/// A point-in-time, read-only view of the configuration.
///
/// Snapshots are shared as `Arc<ConfigSnapshot>` and replaced wholesale on
/// reload; nothing mutates one after it has been published.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub servers: BTreeMap<String, ServerSpec>,
    pub settings: SupervisorSettings,
    /// Environment-file variables to pass to children on top of the inherited
    /// process environment.
    pub environment: BTreeMap<String, String>,
    pub warnings: Vec<ConfigWarning>,
    pub modified: Option<SystemTime>,
}

impl ConfigSnapshot {
    /// Reads both files and produces a validated, substituted snapshot.
    pub fn load(config_path: &Path, env_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (document, modified) = io::read_document(config_path)?;
        validate(config_path, &document)?;
        let env_vars = match env_path {
            Some(path) => io::read_env_file(path)?,
            None => BTreeMap::new(),
        };

        let mut snapshot = Self::from_document(document, Environment::new(env_vars));
        snapshot.modified = modified;
        for warning in &snapshot.warnings {
            warn!(warning = %warning, "Unresolved placeholder left in config");
        }
        Ok(snapshot)
    }

    pub fn from_document(document: ConfigDocument, env: Environment) -> Self {
        let mut servers = BTreeMap::new();
        let mut warnings = Vec::new();
        for (name, entry) in &document.servers {
            let (spec, entry_warnings) = resolve_entry(name, entry, &env);
            warnings.extend(entry_warnings);
            servers.insert(name.clone(), spec);
        }

        Self {
            servers,
            settings: document.settings,
            environment: env.additions(),
            warnings,
            modified: None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ServerSpec> {
        self.servers.get(name)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ServerSpec> {
        self.servers.values().filter(|spec| spec.is_enabled())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// True when anything other than the modification time differs.
    pub fn same_content(&self, other: &ConfigSnapshot) -> bool {
        self.servers == other.servers
            && self.settings == other.settings
            && self.environment == other.environment
    }
}

fn validate(path: &Path, document: &ConfigDocument) -> Result<(), ConfigError> {
    let invalid = |message: String| ConfigError::Validation {
        path: path.to_path_buf(),
        message,
    };

    if document.servers.is_empty() {
        return Err(invalid("no servers are defined".to_string()));
    }
    for (name, entry) in &document.servers {
        if name.trim().is_empty() {
            return Err(invalid("server names must not be empty".to_string()));
        }
        if entry.command.trim().is_empty() {
            return Err(invalid(format!("server '{name}' has no command")));
        }
    }
    Ok(())
}

/// Partition of server names between two snapshots. The four sets are
/// disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub changed: BTreeSet<String>,
    pub unchanged: BTreeSet<String>,
}

impl ConfigDiff {
    pub fn between(old: &ConfigSnapshot, new: &ConfigSnapshot) -> Self {
        let mut diff = ConfigDiff::default();
        for (name, spec) in &new.servers {
            match old.servers.get(name) {
                None => {
                    diff.added.insert(name.clone());
                }
                Some(previous) if previous == spec => {
                    diff.unchanged.insert(name.clone());
                }
                Some(_) => {
                    diff.changed.insert(name.clone());
                }
            }
        }
        for name in old.servers.keys() {
            if !new.servers.contains_key(name) {
                diff.removed.insert(name.clone());
            }
        }
        diff
    }

    /// Diff used for the very first reconcile: everything is new.
    pub fn initial(snapshot: &ConfigSnapshot) -> Self {
        Self {
            added: snapshot.servers.keys().cloned().collect(),
            ..Self::default()
        }
    }

    /// True when applying the diff would not start, stop or restart anything.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Published to subscribers on every reload that changed something.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub old: Arc<ConfigSnapshot>,
    pub new: Arc<ConfigSnapshot>,
    pub diff: ConfigDiff,
}
