pub mod context;
pub mod loop_;
pub mod registry;

pub use context::ContextBuilder;
pub use loop_::{AgentLoop, AssistantReply};
pub use registry::{ToolRegistry, ToolRegistryBuilder};
