pub mod agent;
pub mod config;
pub mod error;
pub mod providers;
pub mod session;
pub mod tools;
pub mod traits;

pub use agent::{AgentLoop, AssistantReply, ContextBuilder, ToolRegistry};
pub use config::*;
pub use error::*;
pub use providers::*;
pub use session::*;
pub use tools::*;
pub use traits::*;
