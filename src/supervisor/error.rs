use crate::mcp::CapabilityError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn server '{server}': {source}")]
    ProcessSpawn {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server '{server}' exited: {detail}")]
    ProcessExit { server: String, detail: String },

    #[error("Server '{server}' is not running")]
    ServerNotRunning { server: String },

    #[error("Server '{server}' does not offer tool '{tool}'")]
    ToolNotFound { server: String, tool: String },

    #[error("Tool '{tool}' on server '{server}' timed out after {}ms", .timeout.as_millis())]
    ToolInvocationTimeout {
        server: String,
        tool: String,
        timeout: Duration,
    },

    #[error("Tool '{tool}' on server '{server}' failed: {source}")]
    ToolInvocation {
        server: String,
        tool: String,
        #[source]
        source: CapabilityError,
    },

    #[error("Unknown server '{server}'")]
    UnknownServer { server: String },
}
