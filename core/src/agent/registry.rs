use crate::config::Config;
use crate::error::ToolError;
use crate::tools::{ExecuteScriptTool, ListScriptsTool, ReadConfigTool, Sandbox, validate_arguments};
use crate::traits::{Tool, ToolSpec};
use serde_json::Value;
use std::sync::Arc;

/// The fixed set of tools available for a run.
///
/// Built once at startup; there is no way to add or remove tools afterwards.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    pub fn register(mut self, tool: impl Tool + 'static) -> Self {
        if self.tools.iter().any(|t| t.name() == tool.name()) {
            tracing::warn!("Ignoring duplicate tool registration: {}", tool.name());
            return self;
        }
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// Registers the config reader and the script tools over the roots named
    /// in `config`.
    pub fn discover(config: &Config) -> Result<Self, ToolError> {
        let configs = Sandbox::new(&config.configs_dir)?;
        let scripts = Sandbox::new(&config.scripts_dir)?;

        let registry = Self::builder()
            .register(ReadConfigTool::new(configs))
            .register(ListScriptsTool::new(scripts.clone()))
            .register(ExecuteScriptTool::new(
                scripts,
                config.interpreter().map(str::to_string),
                config.script_timeout(),
            ))
            .build();

        let names: Vec<String> = registry.list_tools().into_iter().map(|t| t.name).collect();
        tracing::info!(tools = ?names, "Tool registry ready");
        Ok(registry)
    }

    pub fn list_tools(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub async fn invoke(&self, name: &str, arguments: &Value) -> Result<String, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let args = validate_arguments(name, &tool.parameters_schema(), arguments)?;
        tool.execute(&args).await
    }
}
