//! Tool registry for the agent loop.
//!
//! Tools are looked up by name and dispatched through a tagged
//! [`ToolHandle`]: a local [`Tool`] implementation or a tool hosted on an MCP
//! server. Unknown names resolve to [`ToolError::NotFound`] instead of being
//! silently dropped.
//!
//! ```ignore
//! let mut tools = ToolRegistry::new();
//! tools.register_tool(Arc::new(FnTool::new(
//!     "add",
//!     "Add two numbers",
//!     json!({"type": "object", "required": ["a", "b"]}),
//!     |args| async move {
//!         let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
//!         Ok(sum.to_string())
//!     },
//! )))?;
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::ToolError;
use crate::mcp::{self, McpSession};
use crate::traits::{ToolCall, ToolDefinition};

/// Result type of a tool invocation.
pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// A callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name.
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema of the arguments.
    fn parameters(&self) -> JsonValue;

    /// Run the tool and return its textual output.
    async fn invoke(&self, arguments: JsonValue) -> ToolResult<String>;
}

type Handler = Arc<dyn Fn(JsonValue) -> BoxFuture<'static, ToolResult<String>> + Send + Sync>;

/// A [`Tool`] backed by an async closure.
#[derive(Clone)]
pub struct FnTool {
    name: String,
    description: String,
    parameters: JsonValue,
    handler: Handler,
}

impl FnTool {
    /// Wrap `handler` as a tool.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: JsonValue,
        handler: F,
    ) -> Self
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolResult<String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> JsonValue {
        self.parameters.clone()
    }

    async fn invoke(&self, arguments: JsonValue) -> ToolResult<String> {
        (self.handler)(arguments).await
    }
}

/// How a tool is invoked.
#[derive(Clone)]
pub enum ToolHandle {
    /// In-process implementation.
    Local(Arc<dyn Tool>),
    /// Tool hosted by an MCP server.
    Remote {
        /// Server the tool lives on.
        server: String,
        /// Name of the tool on that server.
        remote_name: String,
        /// Session used to reach the server.
        session: Arc<dyn McpSession>,
    },
}

impl fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(tool) => f.debug_tuple("Local").field(&tool.name()).finish(),
            Self::Remote {
                server,
                remote_name,
                ..
            } => f
                .debug_struct("Remote")
                .field("server", server)
                .field("remote_name", remote_name)
                .finish(),
        }
    }
}

/// A named tool with its schema and invocation handle.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: JsonValue,
    pub handle: ToolHandle,
}

impl ToolDescriptor {
    /// Describe a local tool.
    pub fn local(tool: Arc<dyn Tool>) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters(),
            handle: ToolHandle::Local(tool),
        }
    }

    /// Check if the tool lives on an MCP server.
    pub fn is_remote(&self) -> bool {
        matches!(self.handle, ToolHandle::Remote { .. })
    }

    /// Definition sent to the model.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(&self.name, &self.description, self.parameters.clone())
    }

    /// Check `arguments` against the object shape declared in the schema.
    ///
    /// Only the top-level `type: object` and `required` keys are enforced.
    pub fn check_arguments(&self, arguments: &JsonValue) -> ToolResult<()> {
        let declares_object = self.parameters.get("type").and_then(JsonValue::as_str) == Some("object");
        let required = self
            .parameters
            .get("required")
            .and_then(JsonValue::as_array);

        if !declares_object && required.is_none() {
            return Ok(());
        }

        let Some(object) = arguments.as_object() else {
            if arguments.is_null() && required.map_or(true, |r| r.is_empty()) {
                return Ok(());
            }
            return Err(ToolError::InvalidArguments {
                tool: self.name.clone(),
                message: "arguments must be a JSON object".to_string(),
            });
        };

        if let Some(required) = required {
            let missing: Vec<&str> = required
                .iter()
                .filter_map(JsonValue::as_str)
                .filter(|key| !object.contains_key(*key))
                .collect();
            if !missing.is_empty() {
                return Err(ToolError::InvalidArguments {
                    tool: self.name.clone(),
                    message: format!("missing required field(s): {}", missing.join(", ")),
                });
            }
        }
        Ok(())
    }

    /// Validate and invoke.
    pub async fn invoke(&self, arguments: JsonValue) -> ToolResult<String> {
        self.check_arguments(&arguments)?;
        match &self.handle {
            ToolHandle::Local(tool) => tool.invoke(arguments).await,
            ToolHandle::Remote {
                server,
                remote_name,
                session,
            } => {
                debug!(tool = %self.name, server = %server, "Invoking remote tool");
                mcp::call_remote(session.as_ref(), remote_name, arguments).await
            }
        }
    }
}

/// Name → tool lookup, kept in registration order.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Duplicate`] if the name is taken.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> ToolResult<()> {
        if self.index.contains_key(&descriptor.name) {
            return Err(ToolError::Duplicate(descriptor.name));
        }
        self.index.insert(descriptor.name.clone(), self.tools.len());
        self.tools.push(descriptor);
        Ok(())
    }

    /// Register a local tool.
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) -> ToolResult<()> {
        self.register(ToolDescriptor::local(tool))
    }

    /// Builder form of [`register_tool`](Self::register_tool).
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> ToolResult<Self> {
        self.register_tool(tool)?;
        Ok(self)
    }

    /// Look up a tool by name.
    pub fn resolve(&self, name: &str) -> ToolResult<&ToolDescriptor> {
        self.index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// Resolve and invoke a model tool call.
    pub async fn invoke(&self, call: &ToolCall) -> ToolResult<String> {
        let descriptor = self.resolve(&call.name)?;
        descriptor.invoke(call.arguments.clone()).await
    }

    /// Definitions for every tool, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(ToolDescriptor::definition).collect()
    }

    /// Add every tool whose name is not already registered.
    ///
    /// Returns the names that were shadowed by an existing entry.
    pub fn merge(&mut self, other: impl IntoIterator<Item = ToolDescriptor>) -> Vec<String> {
        let mut shadowed = Vec::new();
        for descriptor in other {
            let name = descriptor.name.clone();
            if self.register(descriptor).is_err() {
                shadowed.push(name);
            }
        }
        shadowed
    }

    /// Tool names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Check if a tool is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Number of tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> Arc<dyn Tool> {
        Arc::new(FnTool::new(
            "echo",
            "Echo the text argument",
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
            |args| async move { Ok(args["text"].as_str().unwrap_or_default().to_string()) },
        ))
    }

    fn failing() -> Arc<dyn Tool> {
        Arc::new(FnTool::new("explode", "Always fails", json!({}), |_| async {
            Err(ToolError::Execution {
                tool: "explode".to_string(),
                message: "kaboom".to_string(),
            })
        }))
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let mut registry = ToolRegistry::new();
        registry.register_tool(echo()).unwrap();

        let call = ToolCall::new("c1", "echo", json!({"text": "hello"}));
        assert_eq!(registry.invoke(&call).await.unwrap(), "hello");
        assert!(registry.contains("echo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register_tool(echo()).unwrap();
        assert_eq!(
            registry.register_tool(echo()).unwrap_err(),
            ToolError::Duplicate("echo".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let call = ToolCall::new("c1", "missing", json!({}));
        assert_eq!(
            registry.invoke(&call).await.unwrap_err(),
            ToolError::NotFound("missing".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_required_argument() {
        let registry = ToolRegistry::new().with_tool(echo()).unwrap();
        let call = ToolCall::new("c1", "echo", json!({"other": 1}));
        match registry.invoke(&call).await {
            Err(ToolError::InvalidArguments { tool, message }) => {
                assert_eq!(tool, "echo");
                assert!(message.contains("text"));
            }
            other => panic!("Expected InvalidArguments, got {:?}", other),
        }

        let call = ToolCall::new("c2", "echo", json!("not an object"));
        assert!(matches!(
            registry.invoke(&call).await,
            Err(ToolError::InvalidArguments { .. })
        ));
    }

    #[tokio::test]
    async fn test_execution_error_passes_through() {
        let registry = ToolRegistry::new().with_tool(failing()).unwrap();
        let call = ToolCall::new("c1", "explode", JsonValue::Null);
        assert!(matches!(
            registry.invoke(&call).await,
            Err(ToolError::Execution { .. })
        ));
    }

    #[test]
    fn test_definitions_keep_registration_order() {
        let registry = ToolRegistry::new()
            .with_tool(failing())
            .unwrap()
            .with_tool(echo())
            .unwrap();
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["explode", "echo"]);
    }

    #[test]
    fn test_merge_keeps_existing_entries() {
        let mut local = ToolRegistry::new().with_tool(echo()).unwrap();
        let other = vec![
            ToolDescriptor::local(Arc::new(FnTool::new(
                "echo",
                "Shadowed",
                json!({}),
                |_| async { Ok(String::new()) },
            ))),
            ToolDescriptor::local(failing()),
        ];

        let shadowed = local.merge(other);
        assert_eq!(shadowed, vec!["echo".to_string()]);
        assert_eq!(local.names(), vec!["echo", "explode"]);
        assert_eq!(
            local.resolve("echo").unwrap().description,
            "Echo the text argument"
        );
    }
}
