use crate::core::config::defaults;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One server entry as written in the configuration document, before
/// placeholder substitution.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ServerEntry {
    /// Missing commands are rejected during validation rather than parsing.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Overrides `settings.auto_restart` for this server.
    #[serde(default, alias = "autoRestart")]
    pub auto_restart: Option<bool>,
}

/// Immutable, substituted description of one backend server.
///
/// Specs are compared structurally; a reload that produces a spec that is not
/// equal to the previous one for the same name counts as a change.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ServerSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub disabled: bool,
    pub cwd: Option<String>,
    pub auto_restart: Option<bool>,
}

impl ServerSpec {
    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    /// Resolves the per-server auto-restart override against the global flag.
    pub fn auto_restart_enabled(&self, settings: &SupervisorSettings) -> bool {
        self.auto_restart.unwrap_or(settings.auto_restart)
    }
}

/// Supervisor-wide knobs read from the `[settings]` table.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    #[serde(default = "defaults::auto_restart", alias = "autoRestart")]
    pub auto_restart: bool,
    #[serde(default = "defaults::restart_delay_ms", alias = "restartDelayMs")]
    pub restart_delay_ms: u64,
    #[serde(default = "defaults::stop_timeout_ms", alias = "stopTimeoutMs")]
    pub stop_timeout_ms: u64,
    #[serde(default = "defaults::startup_grace_ms", alias = "startupGraceMs")]
    pub startup_grace_ms: u64,
    #[serde(
        default = "defaults::capability_discovery",
        alias = "capabilityDiscovery"
    )]
    pub capability_discovery: bool,
    #[serde(default = "defaults::handshake_timeout_ms", alias = "handshakeTimeoutMs")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "defaults::tool_call_timeout_ms", alias = "toolCallTimeoutMs")]
    pub tool_call_timeout_ms: u64,
    #[serde(default = "defaults::watch_debounce_ms", alias = "watchDebounceMs")]
    pub watch_debounce_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            auto_restart: defaults::auto_restart(),
            restart_delay_ms: defaults::restart_delay_ms(),
            stop_timeout_ms: defaults::stop_timeout_ms(),
            startup_grace_ms: defaults::startup_grace_ms(),
            capability_discovery: defaults::capability_discovery(),
            handshake_timeout_ms: defaults::handshake_timeout_ms(),
            tool_call_timeout_ms: defaults::tool_call_timeout_ms(),
            watch_debounce_ms: defaults::watch_debounce_ms(),
        }
    }
}

impl SupervisorSettings {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_call_timeout_ms)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}

/// The whole configuration document.
///
/// TOML documents use a `[servers.<name>]` table per server; JSON documents
/// may use the conventional `mcpServers` key instead.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct ConfigDocument {
    #[serde(default)]
    pub settings: SupervisorSettings,
    #[serde(default, alias = "mcpServers")]
    pub servers: BTreeMap<String, ServerEntry>,
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
///
/// # Examples
/// - Unix: `/home/user/.config/mcp-fleet/servers.toml` → `~/.config/mcp-fleet/servers.toml`
/// - Windows: paths are returned unchanged
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
