//! Store registry for dynamic backend resolution.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use cipherchat_common::{Error, Result};

use crate::store::ChatStore;

/// Factory function type for creating store backends.
pub type StoreFactory = Box<dyn Fn(Value) -> Result<Arc<dyn ChatStore>> + Send + Sync>;

/// Registry of store backend factories.
///
/// Allows dynamic registration and resolution of backends by name and
/// JSON configuration.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory.
    ///
    /// # Errors
    /// - Returns error if the name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Store backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a backend by name and configuration.
    ///
    /// # Errors
    /// - Backend not registered
    /// - Configuration invalid for the backend
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn ChatStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Store backend '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get the list of registered backend names.
    pub fn backends(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Check if a backend is registered.
    pub fn has_backend(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in backends.
pub fn create_default_registry() -> StoreRegistry {
    let mut registry = StoreRegistry::new();

    registry
        .register(
            "memory",
            Box::new(|_config| Ok(Arc::new(crate::memory::MemoryStore::new()) as Arc<dyn ChatStore>)),
        )
        .expect("Failed to register memory backend");

    registry
        .register(
            "sqlite",
            Box::new(|config| {
                let path = config
                    .get("path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        Error::InvalidInput("Sqlite backend requires 'path'".to_string())
                    })?;
                Ok(Arc::new(crate::sqlite::SqliteStore::open(path)?) as Arc<dyn ChatStore>)
            }),
        )
        .expect("Failed to register sqlite backend");

    registry
}
