use crate::mcp::capability::CapabilityError;
use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult,
    ListToolsResult, PaginatedRequestParams, RpcError, LATEST_PROTOCOL_VERSION,
};
use serde_json::Value;

/// JSON-RPC code used by servers to indicate an unsupported method.
pub(crate) const MCP_METHOD_NOT_FOUND: i64 = -32601;

pub(crate) fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "mcp-fleet".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("mcp-fleet supervisor".to_string()),
            description: Some("Process supervisor for MCP tool servers".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

pub(crate) fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

pub(crate) fn parse_initialize_result(
    message: ServerMessage,
) -> Result<InitializeResult, CapabilityError> {
    let value = parse_response_value(message)?;
    let result = serde_json::from_value::<InitializeResult>(value)
        .map_err(|err| CapabilityError::Protocol(err.to_string()))?;
    if result.protocol_version.trim().is_empty() {
        return Err(CapabilityError::Protocol(
            "Unexpected initialize response.".to_string(),
        ));
    }
    Ok(result)
}

pub(crate) fn parse_list_tools(message: ServerMessage) -> Result<ListToolsResult, CapabilityError> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<ListToolsResult>(value)
        .map_err(|err| CapabilityError::Protocol(err.to_string()))
}

pub(crate) fn parse_response_value(message: ServerMessage) -> Result<Value, CapabilityError> {
    match message {
        ServerMessage::Response(response) => serde_json::to_value(&response.result)
            .map_err(|err| CapabilityError::Protocol(err.to_string())),
        ServerMessage::Error(error) => Err(rpc_error(&error.error)),
        other => Err(CapabilityError::Protocol(format!(
            "Unexpected MCP server message: {other:?}"
        ))),
    }
}

pub(crate) fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(message, ServerMessage::Error(error) if error.error.code == MCP_METHOD_NOT_FOUND)
}

/// Folds any `data.details` payload into the error message.
pub(crate) fn rpc_error(error: &RpcError) -> CapabilityError {
    let mut message = error.message.clone();
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string_pretty(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                message.push('\n');
                message.push_str(&details);
            }
        }
    }
    CapabilityError::Rpc {
        code: error.code,
        message,
    }
}
