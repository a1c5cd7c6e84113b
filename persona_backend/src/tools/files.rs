//! Virtual file system tools. Paths are absolute strings; directories are
//! only implied by shared prefixes.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::state::mutations::{delete_file, list_directory, read_file, write_file};

use super::{optional_str, required_str, Tool, ToolContext, ToolOutcome, ToolOutput};

const MAX_FILE_BYTES: usize = 256 * 1024;

pub fn tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(WriteFileTool),
        Arc::new(ReadFileTool),
        Arc::new(DeleteFileTool),
        Arc::new(ListDirectoryTool),
    ]
}

fn file_path(params: &Value) -> Result<&str> {
    let path = required_str(params, "path")?;
    if !path.starts_with('/') {
        bail!("Path '{}' must be absolute (start with '/')", path);
    }
    if path.ends_with('/') {
        bail!("Path '{}' names a directory, not a file", path);
    }
    Ok(path)
}

fn path_schema(extra: Value) -> Value {
    let mut properties = json!({
        "path": { "type": "string", "description": "Absolute path, e.g. /notes/today.md" }
    });
    let mut required = vec![json!("path")];
    if let (Some(props), Some(extra)) = (properties.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            props.insert(key.clone(), value.clone());
            required.push(json!(key));
        }
    }
    json!({ "type": "object", "properties": properties, "required": required })
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in your virtual file system."
    }

    fn parameters_schema(&self) -> Value {
        path_schema(json!({ "content": { "type": "string" } }))
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let path = file_path(&params)?;
        let content = params.get("content").and_then(Value::as_str).unwrap_or("");
        if content.len() > MAX_FILE_BYTES {
            return Ok(ToolOutcome::error(format!(
                "Content is {} bytes; the limit is {}",
                content.len(),
                MAX_FILE_BYTES
            )));
        }
        Ok(ToolOutcome::with_delta(
            ToolOutput::Json(json!({ "path": path, "bytes": content.len() })),
            write_file(path, content),
        ))
    }
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from your virtual file system."
    }

    fn parameters_schema(&self) -> Value {
        path_schema(json!({}))
    }

    async fn execute(&self, params: Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let path = file_path(&params)?;
        Ok(ToolOutcome::output(
            match read_file(&ctx.state.virtual_file_system, path) {
                Some(content) => ToolOutput::Text(content.to_string()),
                None => ToolOutput::Error(format!("No such file: {}", path)),
            },
        ))
    }
}

pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file from your virtual file system."
    }

    fn parameters_schema(&self) -> Value {
        path_schema(json!({}))
    }

    async fn execute(&self, params: Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let path = file_path(&params)?;
        Ok(match delete_file(&ctx.state.virtual_file_system, path) {
            Some(delta) => ToolOutcome::with_delta(
                ToolOutput::Text(format!("Deleted {}", path)),
                delta,
            ),
            None => ToolOutcome::error(format!("No such file: {}", path)),
        })
    }
}

pub struct ListDirectoryTool;

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List files and subdirectories directly under a directory (default '/')."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path (default '/')" }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let dir = optional_str(&params, "path").unwrap_or("/");
        let listing = list_directory(&ctx.state.virtual_file_system, dir);
        Ok(ToolOutcome::output(ToolOutput::Json(json!({
            "path": dir,
            "files": listing.files,
            "directories": listing.directories,
        }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgentState;

    fn ctx(state: &AgentState) -> ToolContext<'_> {
        ToolContext {
            state,
            autonomous: false,
        }
    }

    #[tokio::test]
    async fn write_then_list_then_read() {
        let mut state = AgentState::seed("Ada");
        let outcome = WriteFileTool
            .execute(
                json!({"path": "/notes/day1.md", "content": "sunny"}),
                &ctx(&state),
            )
            .await
            .unwrap();
        state.apply(outcome.delta.unwrap());

        let listing = ListDirectoryTool
            .execute(json!({}), &ctx(&state))
            .await
            .unwrap();
        let ToolOutput::Json(listing) = listing.output else {
            panic!("expected json listing");
        };
        assert_eq!(listing["directories"], json!(["notes", "system"]));

        let read = ReadFileTool
            .execute(json!({"path": "/notes/day1.md"}), &ctx(&state))
            .await
            .unwrap();
        assert_eq!(read.output, ToolOutput::Text("sunny".to_string()));
    }

    #[tokio::test]
    async fn relative_and_directory_paths_are_rejected() {
        let state = AgentState::seed("Ada");
        assert!(WriteFileTool
            .execute(json!({"path": "notes.md", "content": ""}), &ctx(&state))
            .await
            .is_err());
        assert!(ReadFileTool
            .execute(json!({"path": "/notes/"}), &ctx(&state))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn deleting_a_missing_file_reports_an_error() {
        let state = AgentState::seed("Ada");
        let outcome = DeleteFileTool
            .execute(json!({"path": "/nope.md"}), &ctx(&state))
            .await
            .unwrap();
        assert!(outcome.delta.is_none());
        assert!(!outcome.output.is_success());
    }
}
