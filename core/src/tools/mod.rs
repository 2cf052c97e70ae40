use crate::error::ToolError;
use serde_json::{Map, Value};

pub mod execute_script;
pub mod list_scripts;
pub mod read_config;
pub mod sandbox;
pub mod schema;

pub use execute_script::ExecuteScriptTool;
pub use list_scripts::ListScriptsTool;
pub use read_config::ReadConfigTool;
pub use sandbox::Sandbox;
pub use schema::validate_arguments;

pub fn extract_string_arg<'a>(
    args: &'a Map<String, Value>,
    key: &str,
    tool: &str,
) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::invalid_arguments(tool, format!("missing '{key}' parameter")))
}

/// Cuts `text` to at most `max_len` bytes on a char boundary and notes how
/// much was dropped.
pub fn truncate_output(text: String, max_len: usize) -> String {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n... (truncated, {} more bytes)",
        &text[..end],
        text.len() - end
    )
}
