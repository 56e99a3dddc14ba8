//! Regex search built-in.
//!
//! Walks the files under a directory and reports lines matching a pattern as
//! `path:line: text`, capped by `max_results`.  Binary-looking files (those
//! that fail UTF-8 reading) are skipped silently.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;

use crate::wn::provider::{ToolDefinition, ToolResult};

use super::{optional_u64, require_str};

const DEFAULT_MAX_RESULTS: u64 = 100;

/// `search { pattern, path?, max_results? }` — regex search over files.
pub fn search_tool() -> ToolDefinition {
    ToolDefinition::new(
        "search",
        "Search files under a directory for lines matching a regular expression.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Regular expression to match"},
                "path": {"type": "string", "description": "Directory to search (default .)"},
                "max_results": {
                    "type": "integer",
                    "description": "Stop after this many matching lines (default 100)",
                    "minimum": 1,
                },
            },
            "required": ["pattern"],
        }),
        Arc::new(|args| {
            Box::pin(async move {
                let pattern = match require_str(&args, "pattern") {
                    Ok(pattern) => pattern.to_string(),
                    Err(err) => return ToolResult::failure(err),
                };
                let root = args
                    .get("path")
                    .and_then(|p| p.as_str())
                    .unwrap_or(".")
                    .to_string();
                let max_results = match optional_u64(&args, "max_results") {
                    Ok(max) => max.unwrap_or(DEFAULT_MAX_RESULTS) as usize,
                    Err(err) => return ToolResult::failure(err),
                };
                let regex = match Regex::new(&pattern) {
                    Ok(regex) => regex,
                    Err(err) => {
                        return ToolResult::failure(format!("invalid pattern: {}", err))
                    }
                };

                // File walking is synchronous plumbing; keep it off the
                // async executor.
                let handle = tokio::task::spawn_blocking(move || {
                    search_dir(Path::new(&root), &regex, max_results)
                });
                match handle.await {
                    Ok(Ok(matches)) if matches.is_empty() => {
                        ToolResult::success("no matches")
                    }
                    Ok(Ok(matches)) => ToolResult::success(matches.join("\n")),
                    Ok(Err(err)) => ToolResult::failure(err),
                    Err(err) => ToolResult::failure(format!("search failed: {}", err)),
                }
            })
        }),
    )
}

fn search_dir(root: &Path, regex: &Regex, max_results: usize) -> Result<Vec<String>, String> {
    let mut matches = Vec::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| format!("cannot read {}: {}", dir.display(), e))?;
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
        files.sort();
        for path in files {
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            for (number, line) in contents.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{}:{}: {}", path.display(), number + 1, line));
                    if matches.len() >= max_results {
                        return Ok(matches);
                    }
                }
            }
        }
    }

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_matching_lines_with_locations() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha\nbeta\ngamma\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "beta again\n").unwrap();

        let tool = search_tool();
        let result = (tool.execute)(serde_json::json!({
            "pattern": "beta",
            "path": dir.path().to_string_lossy(),
        }))
        .await;
        assert!(result.ok);
        let lines: Vec<&str> = result.output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("a.txt:2:"));
    }

    #[tokio::test]
    async fn respects_max_results() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("many.txt"), "x\nx\nx\nx\n").unwrap();

        let tool = search_tool();
        let result = (tool.execute)(serde_json::json!({
            "pattern": "x",
            "path": dir.path().to_string_lossy(),
            "max_results": 2,
        }))
        .await;
        assert!(result.ok);
        assert_eq!(result.output.lines().count(), 2);
    }

    #[tokio::test]
    async fn invalid_regex_is_a_validation_failure() {
        let tool = search_tool();
        let result = (tool.execute)(serde_json::json!({"pattern": "("})).await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("invalid pattern"));
    }

    #[tokio::test]
    async fn empty_result_reports_no_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "nothing here\n").unwrap();

        let tool = search_tool();
        let result = (tool.execute)(serde_json::json!({
            "pattern": "zzz",
            "path": dir.path().to_string_lossy(),
        }))
        .await;
        assert!(result.ok);
        assert_eq!(result.output, "no matches");
    }
}
