//! MCP client speaking newline-delimited JSON-RPC over a child's stdio.

use crate::mcp::capability::{BoxedReader, BoxedWriter, CapabilityClient, CapabilityError};
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{CallToolRequestParams, InitializeResult, RequestId, RpcError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, warn};

mod protocol;

/// Upper bound on `tools/list` pages fetched during one handshake.
const MCP_MAX_TOOL_PAGES: usize = 32;
const STDIO_WRITE_TIMEOUT_SECONDS: u64 = 10;

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

pub struct StdioClient {
    server_id: String,
    stdin: Mutex<BoxedWriter>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    closed: Arc<AtomicBool>,
    server_details: RwLock<Option<InitializeResult>>,
}

impl StdioClient {
    /// Wraps the given streams and starts the reader task. The reader only
    /// holds a weak reference, so dropping the last client handle lets it wind
    /// down once the stream ends.
    pub fn start(server_id: &str, writer: BoxedWriter, reader: BoxedReader) -> Arc<Self> {
        let client = Arc::new(Self {
            server_id: server_id.to_string(),
            stdin: Mutex::new(writer),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicI64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
            server_details: RwLock::new(None),
        });

        Self::spawn_stdout_reader(
            Arc::downgrade(&client),
            client.server_id.clone(),
            client.pending.clone(),
            client.closed.clone(),
            reader,
        );
        client
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn server_details(&self) -> Option<InitializeResult> {
        self.server_details.read().await.clone()
    }

    fn spawn_stdout_reader(
        client: Weak<Self>,
        server_id: String,
        pending: PendingMap,
        closed: Arc<AtomicBool>,
        reader: BoxedReader,
    ) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        debug!(server = %server_id, error = %err, "MCP stdio read failed");
                        break;
                    }
                };
                let value = match serde_json::from_str::<Value>(&line) {
                    Ok(value) => value,
                    Err(_) => {
                        debug!(server = %server_id, stream = "stdout", "{line}");
                        continue;
                    }
                };
                let items = match value {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                for item in items {
                    match serde_json::from_value::<ServerMessage>(item) {
                        Ok(message) => {
                            Self::dispatch_message(&client, &server_id, &pending, message).await
                        }
                        Err(err) => {
                            debug!(server = %server_id, error = %err, "Ignoring malformed MCP message");
                        }
                    }
                }
            }

            closed.store(true, Ordering::SeqCst);
            let dropped = {
                let mut pending = pending.lock().await;
                let count = pending.len();
                pending.clear();
                count
            };
            debug!(server = %server_id, failed_requests = dropped, "MCP stdio stream closed");
        });
    }

    async fn dispatch_message(
        client: &Weak<Self>,
        server_id: &str,
        pending: &PendingMap,
        message: ServerMessage,
    ) {
        match &message {
            ServerMessage::Response(response) => {
                debug!(
                    server = %server_id,
                    response_id = ?response.id,
                    "Received MCP stdio response"
                );
                if let Some(tx) = pending.lock().await.remove(&response.id) {
                    let _ = tx.send(message);
                }
            }
            ServerMessage::Error(error) => {
                debug!(
                    server = %server_id,
                    error_id = ?error.id,
                    error_code = error.error.code,
                    "Received MCP stdio error"
                );
                if let Some(id) = error.id.as_ref() {
                    if let Some(tx) = pending.lock().await.remove(id) {
                        let _ = tx.send(message);
                    }
                }
            }
            ServerMessage::Request(request) => {
                let request_id = request.request_id().clone();
                debug!(
                    server = %server_id,
                    method = %request.method(),
                    request_id = ?request_id,
                    "Declining MCP server request"
                );
                if let Some(client) = client.upgrade() {
                    let error = RpcError::method_not_found()
                        .with_message("Server-initiated requests are not supported.");
                    if let Err(err) = client.send_error(request_id, error).await {
                        warn!(server = %server_id, error = %err, "Failed to answer MCP server request");
                    }
                }
            }
            ServerMessage::Notification(_) => {
                debug!(server = %server_id, "Received MCP stdio notification");
            }
        }
    }

    fn next_request_id(&self) -> RequestId {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        RequestId::Integer(id)
    }

    async fn send_request(
        &self,
        request: RequestFromClient,
        timeout: Duration,
    ) -> Result<ServerMessage, CapabilityError> {
        let request_id = self.next_request_id();
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| CapabilityError::Protocol(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);
        if self.is_closed() {
            self.pending.lock().await.remove(&request_id);
            return Err(CapabilityError::Closed);
        }

        debug!(server = %self.server_id, request_id = ?request_id, "Sending MCP stdio request");
        if let Err(err) = self.write_message(&message).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(CapabilityError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                debug!(
                    server = %self.server_id,
                    request_id = ?request_id,
                    timeout_ms = timeout.as_millis(),
                    "MCP stdio request timed out"
                );
                Err(CapabilityError::Timeout(timeout))
            }
        }
    }

    async fn send_notification(
        &self,
        notification: NotificationFromClient,
    ) -> Result<(), CapabilityError> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| CapabilityError::Protocol(err.to_string()))?;
        self.write_message(&message).await
    }

    async fn send_error(&self, request_id: RequestId, error: RpcError) -> Result<(), CapabilityError> {
        let message =
            ClientMessage::from_message(MessageFromClient::Error(error), Some(request_id))
                .map_err(|err| CapabilityError::Protocol(err.to_string()))?;
        self.write_message(&message).await
    }

    async fn write_message(&self, message: &ClientMessage) -> Result<(), CapabilityError> {
        let mut payload =
            serde_json::to_string(message).map_err(|err| CapabilityError::Protocol(err.to_string()))?;
        payload.push('\n');

        let write_timeout = Duration::from_secs(STDIO_WRITE_TIMEOUT_SECONDS);
        let mut stdin = self.stdin.lock().await;
        tokio::time::timeout(write_timeout, async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.flush().await
        })
        .await
        .map_err(|_| CapabilityError::Timeout(write_timeout))??;
        Ok(())
    }

    async fn initialize(&self, timeout: Duration) -> Result<InitializeResult, CapabilityError> {
        let response = self
            .send_request(
                RequestFromClient::InitializeRequest(protocol::client_details()),
                timeout,
            )
            .await?;
        let result = protocol::parse_initialize_result(response)?;
        *self.server_details.write().await = Some(result.clone());
        self.send_notification(NotificationFromClient::InitializedNotification(None))
            .await?;
        Ok(result)
    }

    async fn list_tool_names(&self, timeout: Duration) -> Result<Vec<String>, CapabilityError> {
        let mut names = Vec::new();
        let mut cursor = None;
        for _ in 0..MCP_MAX_TOOL_PAGES {
            let response = self
                .send_request(
                    RequestFromClient::ListToolsRequest(protocol::paginated_params(cursor)),
                    timeout,
                )
                .await?;
            if protocol::is_method_not_found(&response) {
                return Ok(names);
            }
            let page = protocol::parse_list_tools(response)?;
            names.extend(page.tools.into_iter().map(|tool| tool.name));
            cursor = page.next_cursor;
            if cursor.is_none() {
                return Ok(names);
            }
        }
        warn!(
            server = %self.server_id,
            tools = names.len(),
            "Tool listing truncated after page limit"
        );
        Ok(names)
    }
}

#[async_trait]
impl CapabilityClient for StdioClient {
    async fn handshake(&self, timeout: Duration) -> Result<Vec<String>, CapabilityError> {
        let details = self.initialize(timeout).await?;
        debug!(
            server = %self.server_id,
            remote = %details.server_info.name,
            protocol = %details.protocol_version,
            "MCP session initialized"
        );
        if details.capabilities.tools.is_none() {
            return Ok(Vec::new());
        }
        self.list_tool_names(timeout).await
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, CapabilityError> {
        let params = CallToolRequestParams::new(tool).with_arguments(arguments);
        let response = self
            .send_request(RequestFromClient::CallToolRequest(params), timeout)
            .await?;
        protocol::parse_response_value(response)
    }
}
