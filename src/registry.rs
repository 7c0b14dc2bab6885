//! Backend registry.
//!
//! Name → adapter lookup for backends and embedders. The fallback router and
//! the [`crate::Client`] resolve backend ids through it.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              BackendRegistry                 │
//! ├──────────────────────────────────────────────┤
//! │  Backends:                                   │
//! │  ┌─ primary:   Arc<dyn Backend>              │
//! │  └─ secondary: Arc<dyn Backend>              │
//! │                                              │
//! │  Embedders:                                  │
//! │  └─ default:   Arc<dyn Embedder>             │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut registry = BackendRegistry::new();
//! registry.register(Arc::new(OpenAICompatibleBackend::from_env("openai")?))?;
//! registry.register(Arc::new(MockBackend::new("mock")))?;
//! assert_eq!(registry.list(), vec!["mock", "openai"]);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::traits::{Backend, Embedder};

/// Registry of backends and embedders keyed by name.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
    embedders: HashMap<String, Arc<dyn Embedder>>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own name.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a backend with the same name is registered.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Result<()> {
        let name = backend.name().to_string();
        if self.backends.contains_key(&name) {
            return Err(PipelineError::Config(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        self.backends.insert(name, backend);
        Ok(())
    }

    /// Register an embedder under the given name (replaces any previous one).
    pub fn register_embedder(&mut self, name: impl Into<String>, embedder: Arc<dyn Embedder>) {
        self.embedders.insert(name.into(), embedder);
    }

    /// Get a backend by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    /// Get a backend or fail with `Config`.
    pub fn require(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.get(name)
            .ok_or_else(|| PipelineError::Config(format!("Unknown backend '{}'", name)))
    }

    /// Get an embedder by name.
    pub fn get_embedder(&self, name: &str) -> Option<Arc<dyn Embedder>> {
        self.embedders.get(name).cloned()
    }

    /// Check if a backend is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Registered backend names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered embedder names, sorted.
    pub fn list_embedders(&self) -> Vec<String> {
        let mut names: Vec<String> = self.embedders.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Check if no backends are registered.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.list())
            .field("embedders", &self.list_embedders())
            .finish()
    }
}
