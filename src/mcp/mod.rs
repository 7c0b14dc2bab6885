//! MCP (Model Context Protocol) bridge.
//!
//! Exposes tools hosted by MCP servers to the agent loop. A server is reached
//! through an [`McpSession`]; [`McpClient`] is the stdio implementation that
//! spawns the server process and speaks JSON-RPC 2.0 over its pipes.
//! [`McpServerManager`] owns the sessions and the tool → server routing
//! table.

mod client;
mod manager;
pub mod protocol;

pub use client::{McpClient, REQUEST_TIMEOUT};
pub use manager::{McpServerDescriptor, McpServerManager};
pub use protocol::{McpContent, McpToolDef, McpToolResult};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::error::ToolError;

/// Transport and protocol failures talking to an MCP server.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("MCP transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("MCP request '{0}' timed out")]
    Timeout(String),

    #[error("MCP connection closed")]
    Closed,

    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid MCP response: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// A live connection to one MCP server.
#[async_trait]
pub trait McpSession: Send + Sync {
    /// Name the server was registered under.
    fn server_name(&self) -> &str;

    /// Fetch the server's tool list.
    async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError>;

    /// Call a tool by its server-side name.
    async fn call_tool(&self, name: &str, arguments: JsonValue) -> Result<McpToolResult, McpError>;
}

/// Call a remote tool, turning `isError` results and transport failures into
/// [`ToolError::Execution`].
pub(crate) async fn call_remote(
    session: &dyn McpSession,
    name: &str,
    arguments: JsonValue,
) -> Result<String, ToolError> {
    let arguments = if arguments.is_null() {
        JsonValue::Object(Default::default())
    } else {
        arguments
    };

    match session.call_tool(name, arguments).await {
        Ok(result) if result.is_error => Err(ToolError::Execution {
            tool: name.to_string(),
            message: result.joined_text(),
        }),
        Ok(result) => Ok(result.joined_text()),
        Err(err) => Err(ToolError::Execution {
            tool: name.to_string(),
            message: err.to_string(),
        }),
    }
}
