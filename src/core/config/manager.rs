use crate::core::config::data::ServerSpec;
use crate::core::config::io::ConfigError;
use crate::core::config::snapshot::{ConfigChange, ConfigDiff, ConfigSnapshot};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Result of a `reload()` call.
#[derive(Debug, Clone)]
pub enum ReloadOutcome {
    /// A new snapshot was published.
    Applied(ConfigChange),
    /// The files were re-read but nothing meaningful changed.
    Unchanged,
    /// Another reload was already running; this one did nothing.
    Skipped,
}

/// Owns the current configuration snapshot and publishes changes to it.
pub struct ConfigManager {
    config_path: PathBuf,
    env_path: Option<PathBuf>,
    current: RwLock<Arc<ConfigSnapshot>>,
    pub(crate) reload_gate: Mutex<()>,
    changes: broadcast::Sender<ConfigChange>,
}

impl ConfigManager {
    pub fn new(config_path: PathBuf, env_path: Option<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            config_path,
            env_path,
            current: RwLock::new(Arc::new(ConfigSnapshot::default())),
            reload_gate: Mutex::new(()),
            changes,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn env_path(&self) -> Option<&Path> {
        self.env_path.as_deref()
    }

    /// Loads the configuration and makes it current without publishing a
    /// change. Used once at startup.
    pub fn load(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let snapshot = Arc::new(self.read_snapshot()?);
        info!(
            path = %self.config_path.display(),
            servers = snapshot.servers.len(),
            "Loaded server configuration"
        );
        self.replace_current(snapshot.clone());
        Ok(snapshot)
    }

    /// Re-reads the configuration, diffs it against the current snapshot and
    /// publishes the change before making it current.
    ///
    /// On error the current snapshot is left untouched.
    pub async fn reload(&self) -> Result<ReloadOutcome, ConfigError> {
        let Ok(_gate) = self.reload_gate.try_lock() else {
            debug!("Reload already in progress; skipping");
            return Ok(ReloadOutcome::Skipped);
        };

        let new = Arc::new(self.read_snapshot()?);
        let old = self.current();
        if old.same_content(&new) {
            self.replace_current(new);
            return Ok(ReloadOutcome::Unchanged);
        }

        let diff = ConfigDiff::between(&old, &new);
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            "Configuration reloaded"
        );
        let change = ConfigChange { old, new, diff };
        // No subscribers is fine; the caller also gets the change back.
        let _ = self.changes.send(change.clone());
        self.replace_current(change.new.clone());
        Ok(ReloadOutcome::Applied(change))
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn enabled(&self) -> Vec<ServerSpec> {
        self.current().enabled().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<ServerSpec> {
        self.current().get(name).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }

    fn read_snapshot(&self) -> Result<ConfigSnapshot, ConfigError> {
        ConfigSnapshot::load(&self.config_path, self.env_path.as_deref())
    }

    fn replace_current(&self, snapshot: Arc<ConfigSnapshot>) {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}
