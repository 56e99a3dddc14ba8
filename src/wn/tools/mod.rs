//! Built-in tool implementations.
//!
//! Each built-in is an ordinary [`ToolDefinition`](crate::wn::provider::ToolDefinition)
//! whose `execute` validates its own arguments and answers with a failed
//! `ToolResult` instead of raising.  The standard set is installed by
//! [`register_builtin_tools`] in both the main runtime and every sub-agent
//! worker.
//!
//! - `read_file` / `write_file` / `list_dir` — filesystem access
//! - `shell` — command execution with an optional per-call timeout
//! - `search` — regex search over files under a directory
//! - `calculator` — expression evaluation

pub mod calculator;
pub mod filesystem;
pub mod search;
pub mod shell;

use crate::wn::error::CoreResult;
use crate::wn::tool_registry::ToolRegistry;

/// Install the standard built-in tool set into a registry.
pub fn register_builtin_tools(registry: &mut ToolRegistry) -> CoreResult<()> {
    registry.register(filesystem::read_file_tool())?;
    registry.register(filesystem::write_file_tool())?;
    registry.register(filesystem::list_dir_tool())?;
    registry.register(shell::shell_tool())?;
    registry.register(search::search_tool())?;
    registry.register(calculator::calculator_tool())?;
    Ok(())
}

/// Pull a required string argument, or explain what is missing.
pub(crate) fn require_str<'a>(
    args: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, String> {
    match args.get(key) {
        Some(value) => value
            .as_str()
            .ok_or_else(|| format!("argument '{}' must be a string", key)),
        None => Err(format!("missing required argument '{}'", key)),
    }
}

/// Pull an optional positive integer argument with a lower bound of 1.
pub(crate) fn optional_u64(
    args: &serde_json::Value,
    key: &str,
) -> Result<Option<u64>, String> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => match value.as_u64() {
            Some(n) if n >= 1 => Ok(Some(n)),
            _ => Err(format!("argument '{}' must be a positive integer", key)),
        },
    }
}
