pub mod provider;
pub mod session;
pub mod tool;

pub use provider::{
    ChatMessage, ChatRequest, ChatResponse, Content, ContentPart, Provider, Role, ToolCall,
};
pub use session::{Session, SessionInfo, SessionStore};
pub use tool::{Tool, ToolResult, ToolSpec};
