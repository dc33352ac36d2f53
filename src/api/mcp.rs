//! MCP endpoint: JSON-RPC 2.0 over HTTP POST.
//!
//! Plain JSON responses, one per request. Notifications (no `id`) are
//! acknowledged with `202 Accepted` and no body.

use crate::tools::{DispatchError, Tool, ToolDispatcher};
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const PROTOCOL_VERSION: &str = "2025-06-18";
pub const SESSION_HEADER: &str = "mcp-session-id";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

/// Shared application state for the MCP server
#[derive(Clone)]
pub struct McpAppState {
    pub dispatcher: Arc<ToolDispatcher>,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl RpcResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

impl IntoResponse for RpcResponse {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Create MCP server router
pub fn create_mcp_router(state: McpAppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .route("/mcp", post(mcp))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// GET /
async fn banner() -> Json<Value> {
    Json(json!({
        "service": "kite-mcp",
        "endpoints": ["/mcp", "/health"]
    }))
}

/// GET /health
async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "server": "mcp"}))
}

/// POST /mcp
async fn mcp(State(state): State<Arc<McpAppState>>, body: String) -> Response {
    let raw: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            debug!("Unparseable JSON-RPC body: {}", e);
            return RpcResponse::error(Value::Null, PARSE_ERROR, format!("Parse error: {}", e))
                .into_response();
        }
    };

    let request: RpcRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(e) => {
            return RpcResponse::error(Value::Null, INVALID_REQUEST, format!("Invalid request: {}", e))
                .into_response();
        }
    };

    if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
        return RpcResponse::error(
            request.id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "Unsupported jsonrpc version",
        )
        .into_response();
    }

    let Some(id) = request.id else {
        debug!(method = %request.method, "Notification acknowledged");
        return StatusCode::ACCEPTED.into_response();
    };

    debug!(method = %request.method, "JSON-RPC request");

    match request.method.as_str() {
        "initialize" => initialize(id, &request.params),
        "ping" => RpcResponse::result(id, json!({})).into_response(),
        "tools/list" => RpcResponse::result(id, tools_list()).into_response(),
        "tools/call" => tools_call(&state.dispatcher, id, request.params)
            .await
            .into_response(),
        method if method.starts_with("notifications/") => StatusCode::ACCEPTED.into_response(),
        method => RpcResponse::error(
            id,
            METHOD_NOT_FOUND,
            format!("Method '{}' not supported", method),
        )
        .into_response(),
    }
}

fn initialize(id: Value, params: &Value) -> Response {
    let protocol_version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(PROTOCOL_VERSION)
        .to_string();

    let session_id = Uuid::new_v4().to_string();
    info!(session_id = %session_id, protocol_version = %protocol_version, "MCP session initialized");

    let result = json!({
        "protocolVersion": protocol_version,
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": {
            "name": "kite-mcp",
            "version": env!("CARGO_PKG_VERSION")
        }
    });

    let mut response = RpcResponse::result(id, result).into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn tools_list() -> Value {
    let tools: Vec<Value> = Tool::ALL
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name(),
                "description": tool.description(),
                "inputSchema": tool.input_schema()
            })
        })
        .collect();
    json!({ "tools": tools })
}

async fn tools_call(dispatcher: &ToolDispatcher, id: Value, params: Value) -> RpcResponse {
    let params: ToolCallParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => {
            return RpcResponse::error(id, INVALID_PARAMS, format!("Invalid tools/call params: {}", e))
        }
    };

    match dispatcher.call_by_name(&params.name, &params.arguments).await {
        Ok(result) => {
            let structured = match serde_json::to_value(&result) {
                Ok(value) => value,
                Err(e) => return RpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
            };
            RpcResponse::result(
                id,
                json!({
                    "content": [{ "type": "text", "text": result.summary }],
                    "structuredContent": structured,
                    "isError": !result.success
                }),
            )
        }
        Err(e @ DispatchError::UnknownTool(_)) => RpcResponse::error(id, INVALID_PARAMS, e.to_string()),
        Err(e @ DispatchError::Internal(_)) => {
            warn!(tool = %params.name, error = %e, "Tool call failed");
            RpcResponse::error(id, INTERNAL_ERROR, e.to_string())
        }
    }
}
