//! MCP server lifecycle and tool routing.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use super::client::McpClient;
use super::{call_remote, McpError, McpSession};
use crate::error::ToolError;
use crate::tools::{ToolDescriptor, ToolHandle};

/// How to launch an MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerDescriptor {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl McpServerDescriptor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone)]
struct Route {
    server: String,
    session: Arc<dyn McpSession>,
}

#[derive(Default)]
struct Catalog {
    tools: Vec<ToolDescriptor>,
    routes: HashMap<String, Route>,
}

/// Owns MCP sessions and memoizes their tool catalog.
///
/// Discovery builds a tool → server routing table once; `call_tool` is a map
/// lookup after that. Adding or attaching a server invalidates the catalog.
#[derive(Default)]
pub struct McpServerManager {
    descriptors: RwLock<BTreeMap<String, McpServerDescriptor>>,
    sessions: RwLock<BTreeMap<String, Arc<dyn McpSession>>>,
    catalog: RwLock<Option<Arc<Catalog>>>,
}

impl McpServerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server to launch. It is not connected until
    /// [`connect_all`](Self::connect_all).
    pub fn add_server(&self, name: impl Into<String>, descriptor: McpServerDescriptor) {
        self.descriptors.write().insert(name.into(), descriptor);
    }

    /// Attach an already connected session under `name`.
    pub fn attach(&self, name: impl Into<String>, session: Arc<dyn McpSession>) {
        self.sessions.write().insert(name.into(), session);
        self.invalidate();
    }

    /// Launch every registered server that is not connected yet.
    ///
    /// Returns the servers that failed to start; the others stay usable.
    pub async fn connect_all(&self) -> Vec<(String, McpError)> {
        let to_connect: Vec<(String, McpServerDescriptor)> = {
            let sessions = self.sessions.read();
            self.descriptors
                .read()
                .iter()
                .filter(|(name, _)| !sessions.contains_key(*name))
                .map(|(name, d)| (name.clone(), d.clone()))
                .collect()
        };

        let mut errors = Vec::new();
        for (name, descriptor) in to_connect {
            match McpClient::connect(name.clone(), &descriptor).await {
                Ok(client) => {
                    info!(server = %name, command = %descriptor.command, "MCP server connected");
                    self.attach(name, Arc::new(client));
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "Failed to connect MCP server");
                    errors.push((name, e));
                }
            }
        }
        errors
    }

    /// Names of connected servers, sorted.
    pub fn servers(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Check if `name` has a live session.
    pub fn is_connected(&self, name: &str) -> bool {
        self.sessions.read().contains_key(name)
    }

    fn invalidate(&self) {
        *self.catalog.write() = None;
    }

    /// Tools of every connected server, with remote handles.
    ///
    /// Servers are listed in name order; a tool name already seen on an
    /// earlier server is skipped. Servers whose listing fails are skipped
    /// with a warning.
    pub async fn discover(&self) -> Vec<ToolDescriptor> {
        if let Some(catalog) = self.catalog.read().clone() {
            return catalog.tools.clone();
        }

        let sessions: Vec<(String, Arc<dyn McpSession>)> = self
            .sessions
            .read()
            .iter()
            .map(|(name, s)| (name.clone(), s.clone()))
            .collect();

        let mut catalog = Catalog::default();
        for (server, session) in sessions {
            let defs = match session.list_tools().await {
                Ok(defs) => defs,
                Err(e) => {
                    warn!(server = %server, error = %e, "Failed to list MCP tools");
                    continue;
                }
            };

            for def in defs {
                if let Some(existing) = catalog.routes.get(&def.name) {
                    warn!(
                        tool = %def.name,
                        server = %server,
                        kept = %existing.server,
                        "Duplicate MCP tool name, keeping first"
                    );
                    continue;
                }
                catalog.routes.insert(
                    def.name.clone(),
                    Route {
                        server: server.clone(),
                        session: session.clone(),
                    },
                );
                catalog.tools.push(ToolDescriptor {
                    name: def.name.clone(),
                    description: def.description,
                    parameters: def.input_schema,
                    handle: ToolHandle::Remote {
                        server: server.clone(),
                        remote_name: def.name,
                        session: session.clone(),
                    },
                });
            }
        }

        info!(tools = catalog.tools.len(), "MCP tools discovered");
        let tools = catalog.tools.clone();
        *self.catalog.write() = Some(Arc::new(catalog));
        tools
    }

    /// Drop the cached catalog and discover again.
    pub async fn refresh(&self) -> Vec<ToolDescriptor> {
        self.invalidate();
        self.discover().await
    }

    /// Server hosting `tool`, per the current catalog.
    pub async fn server_for(&self, tool: &str) -> Option<String> {
        self.route(tool).await.map(|r| r.server)
    }

    async fn route(&self, tool: &str) -> Option<Route> {
        let cached = self.catalog.read().clone();
        let catalog = match cached {
            Some(catalog) => catalog,
            None => {
                self.discover().await;
                self.catalog.read().clone()?
            }
        };
        catalog.routes.get(tool).cloned()
    }

    /// Call a discovered tool by name.
    pub async fn call_tool(&self, name: &str, arguments: JsonValue) -> Result<String, ToolError> {
        let route = self
            .route(name)
            .await
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        call_remote(route.session.as_ref(), name, arguments).await
    }
}
