use crate::error::ToolError;
use crate::tools::Sandbox;
use crate::traits::Tool;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

pub struct ListScriptsTool {
    sandbox: Sandbox,
}

impl ListScriptsTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    async fn entries(&self) -> Result<Vec<String>, ToolError> {
        let root = self.sandbox.root();
        let io_err = |source| ToolError::Io {
            path: root.to_path_buf(),
            source,
        };

        let mut dir = tokio::fs::read_dir(root).await.map_err(io_err)?;
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl Tool for ListScriptsTool {
    fn name(&self) -> &str {
        "list_scripts"
    }

    fn description(&self) -> &str {
        "List all automation scripts available in the scripts directory"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    async fn execute(&self, _args: &Map<String, Value>) -> Result<String, ToolError> {
        let names = self.entries().await?;
        Ok(Value::from(names).to_string())
    }
}
