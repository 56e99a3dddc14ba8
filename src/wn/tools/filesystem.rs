//! Filesystem built-ins: `read_file`, `write_file`, `list_dir`.
//!
//! All three validate their arguments inside `execute` and surface I/O
//! failures as failed tool results the model can read and recover from.

use std::sync::Arc;

use crate::wn::provider::{ToolDefinition, ToolResult};

use super::require_str;

/// `read_file { path }` — return a file's contents as text.
pub fn read_file_tool() -> ToolDefinition {
    ToolDefinition::new(
        "read_file",
        "Read a text file and return its contents.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path of the file to read"},
            },
            "required": ["path"],
        }),
        Arc::new(|args| {
            Box::pin(async move {
                let path = match require_str(&args, "path") {
                    Ok(path) => path.to_string(),
                    Err(err) => return ToolResult::failure(err),
                };
                match tokio::fs::read_to_string(&path).await {
                    Ok(contents) => ToolResult::success(contents),
                    Err(err) => ToolResult::failure(format!("cannot read {}: {}", path, err)),
                }
            })
        }),
    )
}

/// `write_file { path, content }` — write text, creating parent directories.
pub fn write_file_tool() -> ToolDefinition {
    ToolDefinition::new(
        "write_file",
        "Write text content to a file, creating parent directories as needed.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Destination path"},
                "content": {"type": "string", "description": "Text to write"},
            },
            "required": ["path", "content"],
        }),
        Arc::new(|args| {
            Box::pin(async move {
                let path = match require_str(&args, "path") {
                    Ok(path) => path.to_string(),
                    Err(err) => return ToolResult::failure(err),
                };
                let content = match require_str(&args, "content") {
                    Ok(content) => content.to_string(),
                    Err(err) => return ToolResult::failure(err),
                };
                if let Some(parent) = std::path::Path::new(&path).parent() {
                    if !parent.as_os_str().is_empty() {
                        if let Err(err) = tokio::fs::create_dir_all(parent).await {
                            return ToolResult::failure(format!(
                                "cannot create {}: {}",
                                parent.display(),
                                err
                            ));
                        }
                    }
                }
                match tokio::fs::write(&path, content.as_bytes()).await {
                    Ok(()) => {
                        ToolResult::success(format!("Wrote {} bytes to {}", content.len(), path))
                    }
                    Err(err) => ToolResult::failure(format!("cannot write {}: {}", path, err)),
                }
            })
        }),
    )
}

/// `list_dir { path }` — one entry per line, directories marked with `/`.
pub fn list_dir_tool() -> ToolDefinition {
    ToolDefinition::new(
        "list_dir",
        "List the entries of a directory.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory to list"},
            },
            "required": ["path"],
        }),
        Arc::new(|args| {
            Box::pin(async move {
                let path = match require_str(&args, "path") {
                    Ok(path) => path.to_string(),
                    Err(err) => return ToolResult::failure(err),
                };
                let mut entries = match tokio::fs::read_dir(&path).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        return ToolResult::failure(format!("cannot list {}: {}", path, err))
                    }
                };
                let mut names: Vec<String> = Vec::new();
                loop {
                    match entries.next_entry().await {
                        Ok(Some(entry)) => {
                            let mut name = entry.file_name().to_string_lossy().into_owned();
                            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                                name.push('/');
                            }
                            names.push(name);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            return ToolResult::failure(format!("cannot list {}: {}", path, err))
                        }
                    }
                }
                names.sort();
                ToolResult::success(names.join("\n"))
            })
        }),
    )
}
