//! Root configuration loading.
//!
//! The runtime reads a single JSON file (`config.json` inside a resource
//! directory) describing the default provider/model/persona, the provider
//! credential table, and the optional list of stdio tool servers.  Strings at
//! any depth may reference environment variables as `${VAR}`; unresolved
//! references are left literal so placeholders survive round-trips.
//!
//! A missing file yields the defaults; a file that exists but fails to parse
//! is a fatal configuration error.
//!
//! # Example
//!
//! ```rust
//! use wn_core::wn::config::RootConfig;
//!
//! let config: RootConfig = serde_json::from_str(r#"{
//!     "defaultProvider": "openai",
//!     "providers": { "openai": { "apiKey": "sk-test" } }
//! }"#).unwrap();
//! assert_eq!(config.default_provider, "openai");
//! assert_eq!(config.default_persona, "default");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::wn::error::{CoreError, CoreResult};

/// Credentials and endpoint override for one provider entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderEntry {
    /// API key, where the vendor uses one.
    pub api_key: Option<String>,
    /// Bearer token alternative (Anthropic-style `authToken`).
    pub auth_token: Option<String>,
    /// Endpoint override; each adapter has its own default.
    pub base_url: Option<String>,
}

/// Launch specification for one stdio tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerSpec {
    /// Server name; prefixes every tool it contributes.
    pub name: String,
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the subprocess.
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

/// The `mcp` section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpSection {
    /// Ordered tool-server list.
    #[serde(default)]
    pub servers: Vec<McpServerSpec>,
}

/// Process-wide root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RootConfig {
    /// Provider used when neither the CLI nor a sub-agent picks one.
    pub default_provider: String,
    /// Model used when none is specified.
    pub default_model: String,
    /// Persona used when none is specified.
    pub default_persona: String,
    /// Provider-name to credential mapping.
    pub providers: HashMap<String, ProviderEntry>,
    /// Optional stdio tool-server section.
    pub mcp: Option<McpSection>,
}

impl Default for RootConfig {
    fn default() -> Self {
        RootConfig {
            default_provider: "claude".to_string(),
            default_model: "claude-sonnet-4-20250514".to_string(),
            default_persona: "default".to_string(),
            providers: HashMap::new(),
            mcp: None,
        }
    }
}

impl RootConfig {
    /// Load configuration from `path`.
    ///
    /// Missing file ⇒ defaults.  Unreadable or unparseable file ⇒
    /// `CoreError::Config` (fatal at startup).
    pub fn load(path: &Path) -> CoreResult<RootConfig> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RootConfig::default());
            }
            Err(err) => {
                return Err(CoreError::Config(format!(
                    "cannot read {}: {}",
                    path.display(),
                    err
                )));
            }
        };

        let mut value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
            CoreError::Config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        substitute_env(&mut value);

        serde_json::from_value(value)
            .map_err(|e| CoreError::Config(format!("invalid config {}: {}", path.display(), e)))
    }

    /// The tool-server list, empty when the `mcp` section is absent.
    pub fn tool_servers(&self) -> Vec<McpServerSpec> {
        self.mcp
            .as_ref()
            .map(|section| section.servers.clone())
            .unwrap_or_default()
    }
}

/// Resolve `${VAR}` references in every string of a JSON tree.
pub fn substitute_env(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            let substituted = substitute_str(s);
            if substituted != *s {
                *s = substituted;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_env(item);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_env(item);
            }
        }
        _ => {}
    }
}

fn substitute_str(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                match std::env::var(var) {
                    Ok(resolved) => out.push_str(&resolved),
                    // Unresolved references remain literal.
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(var);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RootConfig::default();
        assert_eq!(config.default_provider, "claude");
        assert_eq!(config.default_persona, "default");
        assert!(config.tool_servers().is_empty());
    }

    #[test]
    fn env_references_resolve_at_any_depth() {
        std::env::set_var("WN_TEST_KEY_1", "resolved");
        let mut value = serde_json::json!({
            "providers": {"openai": {"apiKey": "${WN_TEST_KEY_1}"}},
            "list": ["${WN_TEST_KEY_1}", "plain"],
        });
        substitute_env(&mut value);
        assert_eq!(value["providers"]["openai"]["apiKey"], "resolved");
        assert_eq!(value["list"][0], "resolved");
        assert_eq!(value["list"][1], "plain");
    }

    #[test]
    fn unresolved_references_stay_literal() {
        let mut value = serde_json::json!("${WN_TEST_DOES_NOT_EXIST} and ${");
        substitute_env(&mut value);
        assert_eq!(value, "${WN_TEST_DOES_NOT_EXIST} and ${");
    }

    #[test]
    fn missing_file_yields_defaults_and_bad_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("config.json");
        let config = RootConfig::load(&missing).unwrap();
        assert_eq!(config.default_provider, "claude");

        std::fs::write(&missing, "{not json").unwrap();
        assert!(RootConfig::load(&missing).is_err());
    }

    #[test]
    fn mcp_servers_deserialize() {
        let config: RootConfig = serde_json::from_str(
            r#"{
                "mcp": {"servers": [
                    {"name": "nmap", "command": "nmap-mcp", "args": ["--stdio"]}
                ]}
            }"#,
        )
        .unwrap();
        let servers = config.tool_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "nmap");
        assert_eq!(servers[0].args, vec!["--stdio"]);
    }
}
