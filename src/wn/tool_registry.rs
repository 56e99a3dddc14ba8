//! Registry for the tools an agent can invoke.
//!
//! Two keyed stores back the registry: **built-in** tools (in-process
//! functions) and **external** tools (stdio tool-server wrappers).  Names
//! must be unique within a store; across stores, built-in entries shadow
//! external ones of the same name both for lookup and listing.  The registry
//! is populated during startup and read-only afterwards, so lookups take
//! `&self` and hand out cheap `Arc` clones.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use wn_core::wn::provider::{ToolDefinition, ToolResult};
//! use wn_core::wn::tool_registry::ToolRegistry;
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(ToolDefinition::new(
//!     "echo",
//!     "Echoes its input",
//!     serde_json::json!({"type": "object", "properties": {}}),
//!     Arc::new(|args| Box::pin(async move {
//!         ToolResult::success(args.to_string())
//!     })),
//! )).unwrap();
//!
//! assert!(registry.get("echo").is_some());
//! assert!(registry.get("missing").is_none());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::wn::error::{CoreError, CoreResult};
use crate::wn::provider::ToolDefinition;

/// Two-tier tool store with built-in-over-external shadowing.
#[derive(Default)]
pub struct ToolRegistry {
    builtin: HashMap<String, Arc<ToolDefinition>>,
    external: HashMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in tool.  Rejects duplicates within the built-in store.
    pub fn register(&mut self, tool: ToolDefinition) -> CoreResult<()> {
        if self.builtin.contains_key(&tool.name) {
            return Err(CoreError::Tool(format!(
                "duplicate builtin tool: {}",
                tool.name
            )));
        }
        self.builtin.insert(tool.name.clone(), Arc::new(tool));
        Ok(())
    }

    /// Register an external tool.  Rejects duplicates within the external store.
    pub fn register_external(&mut self, tool: ToolDefinition) -> CoreResult<()> {
        if self.external.contains_key(&tool.name) {
            return Err(CoreError::Tool(format!(
                "duplicate external tool: {}",
                tool.name
            )));
        }
        self.external.insert(tool.name.clone(), Arc::new(tool));
        Ok(())
    }

    /// Look a tool up by name; built-in shadows external.
    pub fn get(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.builtin
            .get(name)
            .or_else(|| self.external.get(name))
            .cloned()
    }

    /// The union of both stores, with built-in entries overriding external
    /// entries of the same name.  Iteration order is not specified.
    pub fn list(&self) -> Vec<Arc<ToolDefinition>> {
        let mut merged: HashMap<&str, Arc<ToolDefinition>> = HashMap::new();
        for (name, tool) in &self.external {
            merged.insert(name.as_str(), tool.clone());
        }
        for (name, tool) in &self.builtin {
            merged.insert(name.as_str(), tool.clone());
        }
        merged.into_values().collect()
    }

    /// Number of distinct tool names visible to the model.
    pub fn len(&self) -> usize {
        self.list().len()
    }

    /// True when no tool is registered in either store.
    pub fn is_empty(&self) -> bool {
        self.builtin.is_empty() && self.external.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wn::provider::ToolResult;

    fn tool(name: &str, marker: &'static str) -> ToolDefinition {
        ToolDefinition::new(
            name,
            marker,
            serde_json::json!({"type": "object"}),
            Arc::new(move |_| Box::pin(async move { ToolResult::success(marker) })),
        )
    }

    #[test]
    fn duplicate_names_are_rejected_per_store() {
        let mut registry = ToolRegistry::new();
        registry.register(tool("x", "one")).unwrap();
        assert!(registry.register(tool("x", "two")).is_err());

        registry.register_external(tool("y", "ext")).unwrap();
        assert!(registry.register_external(tool("y", "ext2")).is_err());
    }

    #[tokio::test]
    async fn builtin_shadows_external_in_get_and_list() {
        let mut registry = ToolRegistry::new();
        registry.register(tool("x", "builtin")).unwrap();
        registry.register_external(tool("x", "external")).unwrap();

        let found = registry.get("x").unwrap();
        assert_eq!(found.description, "builtin");

        let listed = registry.list();
        let xs: Vec<_> = listed.iter().filter(|t| t.name == "x").collect();
        assert_eq!(xs.len(), 1);
        assert_eq!(xs[0].description, "builtin");

        let result = (xs[0].execute)(serde_json::json!({})).await;
        assert_eq!(result.output, "builtin");
    }

    #[test]
    fn external_tools_resolve_when_not_shadowed() {
        let mut registry = ToolRegistry::new();
        registry.register_external(tool("srv__scan", "ext")).unwrap();
        assert!(registry.get("srv__scan").is_some());
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }
}
