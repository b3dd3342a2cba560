//! Capability clients attached to supervised children.
//!
//! A client owns the child's stdio once the process is up. Which client is
//! used is decided by configuration through [`CapabilityMode`]; nothing is
//! probed at runtime.

use crate::core::config::SupervisorSettings;
use crate::mcp::client::StdioClient;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The three standard streams of a spawned child.
pub struct ChildIo {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("I/O error talking to server: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Server closed its output stream")]
    Closed,

    #[error("Server does not speak the capability protocol")]
    Unsupported,
}

/// Per-instance protocol session.
#[async_trait]
pub trait CapabilityClient: Send + Sync {
    /// Negotiates the session and returns the names of the tools the server
    /// offers.
    async fn handshake(&self, timeout: Duration) -> Result<Vec<String>, CapabilityError>;

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, CapabilityError>;
}

/// Builds a capability client around a freshly spawned child's streams.
pub trait CapabilityConnector: Send + Sync {
    fn attach(&self, server: &str, io: ChildIo) -> Arc<dyn CapabilityClient>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityMode {
    /// No protocol; output is drained into the debug log.
    PassThrough,
    /// MCP JSON-RPC over stdio.
    Mcp,
}

impl CapabilityMode {
    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        if settings.capability_discovery {
            CapabilityMode::Mcp
        } else {
            CapabilityMode::PassThrough
        }
    }
}

impl CapabilityConnector for CapabilityMode {
    fn attach(&self, server: &str, io: ChildIo) -> Arc<dyn CapabilityClient> {
        spawn_stderr_drain(server, io.stderr);
        match self {
            CapabilityMode::PassThrough => PassThroughClient::start(server, io.stdin, io.stdout),
            CapabilityMode::Mcp => StdioClient::start(server, io.stdin, io.stdout),
        }
    }
}

/// Logs every stderr line of a child at debug level until the stream closes.
pub fn spawn_stderr_drain(server: &str, stderr: BoxedReader) {
    let server = server.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(server = %server, stream = "stderr", "{line}");
        }
    });
}

/// Keeps the child's stdin open and logs its stdout; offers no tools.
pub struct PassThroughClient {
    _stdin: Mutex<BoxedWriter>,
}

impl PassThroughClient {
    pub fn start(server: &str, stdin: BoxedWriter, stdout: BoxedReader) -> Arc<dyn CapabilityClient> {
        let server = server.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %server, stream = "stdout", "{line}");
            }
        });
        Arc::new(Self {
            _stdin: Mutex::new(stdin),
        })
    }
}

#[async_trait]
impl CapabilityClient for PassThroughClient {
    async fn handshake(&self, _timeout: Duration) -> Result<Vec<String>, CapabilityError> {
        Ok(Vec::new())
    }

    async fn call_tool(
        &self,
        _tool: &str,
        _arguments: Map<String, Value>,
        _timeout: Duration,
    ) -> Result<Value, CapabilityError> {
        Err(CapabilityError::Unsupported)
    }
}
