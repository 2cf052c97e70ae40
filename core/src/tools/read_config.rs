use crate::error::ToolError;
use crate::tools::{Sandbox, extract_string_arg, truncate_output};
use crate::traits::Tool;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

const MAX_CONFIG_LEN: usize = 50_000;

pub struct ReadConfigTool {
    sandbox: Sandbox,
}

impl ReadConfigTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ReadConfigTool {
    fn name(&self) -> &str {
        "read_local_config"
    }

    fn description(&self) -> &str {
        "Read a configuration file (server logs, terraform files, app configs) from the local configs directory"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_name": {
                    "type": "string",
                    "description": "File name relative to the configs directory"
                }
            },
            "required": ["file_name"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let file_name = extract_string_arg(args, "file_name", self.name())?;
        let path = self.sandbox.resolve(file_name)?;

        if !path.is_file() {
            return Err(ToolError::invalid_arguments(
                self.name(),
                format!("'{file_name}' is not a file"),
            ));
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ToolError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(truncate_output(content, MAX_CONFIG_LEN))
    }
}
