//! Default values for the `[settings]` table.

pub const DEFAULT_CONFIG_FILE_NAME: &str = "mcp-fleet.toml";
pub const DEFAULT_ENV_FILE_NAME: &str = ".env";

pub(crate) fn auto_restart() -> bool {
    true
}

pub(crate) fn restart_delay_ms() -> u64 {
    5_000
}

pub(crate) fn stop_timeout_ms() -> u64 {
    5_000
}

/// A process that dies within this window after spawn never reaches `running`.
pub(crate) fn startup_grace_ms() -> u64 {
    500
}

pub(crate) fn capability_discovery() -> bool {
    true
}

pub(crate) fn handshake_timeout_ms() -> u64 {
    10_000
}

pub(crate) fn tool_call_timeout_ms() -> u64 {
    60_000
}

pub(crate) fn watch_debounce_ms() -> u64 {
    1_000
}
