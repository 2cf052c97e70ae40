use crate::traits::{ChatMessage, Role, ToolSpec};
use std::fmt::Write;
use std::path::{Path, PathBuf};

const DEFAULT_MAX_HISTORY: usize = 50;

/// Builds what the model actually sees: a system prompt plus a bounded
/// window of the session history.
pub struct ContextBuilder {
    pub configs_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub tool_specs: Vec<ToolSpec>,
    pub max_history: usize,
}

impl ContextBuilder {
    pub fn new(configs_dir: impl AsRef<Path>, scripts_dir: impl AsRef<Path>) -> Self {
        Self {
            configs_dir: configs_dir.as_ref().to_path_buf(),
            scripts_dir: scripts_dir.as_ref().to_path_buf(),
            tool_specs: vec![],
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    pub fn with_tool_specs(mut self, tool_specs: Vec<ToolSpec>) -> Self {
        self.tool_specs = tool_specs;
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    pub fn build_system_prompt(&self) -> String {
        let mut parts = vec![
            "You are an infrastructure helper. Answer questions about the local \
             configuration files and automation scripts, using the tools below \
             when you need to look something up or run something. When you have \
             enough information, reply in plain text without calling a tool."
                .to_string(),
        ];

        let tools = self.get_tool_instructions();
        if !tools.is_empty() {
            parts.push(tools);
        }
        parts.push(self.get_runtime_context());

        parts.join("\n\n---\n\n")
    }

    fn get_tool_instructions(&self) -> String {
        if self.tool_specs.is_empty() {
            return String::new();
        }

        let mut instructions = String::new();
        instructions.push_str("## Tool Use Protocol\n\n");
        instructions.push_str("Prefer native function calls. If you cannot emit them, wrap a JSON object in <tool_call> tags:\n\n");
        instructions.push_str("```\n<tool_call>\n{\"name\": \"tool_name\", \"arguments\": {\"param\": \"value\"}}\n</tool_call>\n```\n\n");
        instructions.push_str("You may request several tools in one response; they run in the order given. ");
        instructions.push_str("Each result comes back tagged with the id of the call that produced it. ");
        instructions.push_str("Results starting with \"Error:\" mean the tool could not run.\n\n");
        instructions.push_str("### Available Tools\n\n");

        for tool in &self.tool_specs {
            let _ = writeln!(
                instructions,
                "**{}**: {}\nParameters: `{}`\n",
                tool.name, tool.description, tool.parameters_schema
            );
        }

        instructions
    }

    fn get_runtime_context(&self) -> String {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M (%A)");

        format!(
            "## Runtime Context

### Current Time
{}

### Configs Directory
{}

### Scripts Directory
{}",
            timestamp,
            self.configs_dir.display(),
            self.scripts_dir.display()
        )
    }

    /// Start index of the history window over `history`.
    ///
    /// The window holds at most `max_history` messages and always begins at a
    /// user message, so no tool result is sent without the call that asked
    /// for it. If the last user message alone exceeds the budget, the window
    /// starts there anyway.
    pub fn window_start(&self, history: &[ChatMessage]) -> usize {
        let cut = history.len().saturating_sub(self.max_history);
        let last_user = history.iter().rposition(|m| m.role == Role::User);

        let aligned = history[cut..]
            .iter()
            .position(|m| m.role == Role::User)
            .map(|offset| cut + offset);

        match (aligned, last_user) {
            (Some(start), _) => start,
            (None, Some(user)) => user,
            (None, None) => cut,
        }
    }

    pub fn build_messages(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let start = self.window_start(history);
        let mut messages = Vec::with_capacity(history.len() - start + 1);
        messages.push(ChatMessage::system(self.build_system_prompt()));
        messages.extend_from_slice(&history[start..]);
        messages
    }
}
