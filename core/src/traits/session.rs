use crate::error::SessionError;
use crate::traits::ChatMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An ordered, append-only conversation addressed by an opaque id.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    messages: Vec<ChatMessage>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    pub fn with_messages(
        id: impl Into<String>,
        created_at: DateTime<Utc>,
        messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            id: id.into(),
            created_at,
            messages,
        }
    }

    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Drops the last message if it was never persisted.
    pub(crate) fn rollback_last(&mut self) -> Option<ChatMessage> {
        self.messages.pop()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the checkpointed history, or an empty session for an unseen id.
    async fn load(&self, session_id: &str) -> Result<Session, SessionError>;

    /// Persists the full current state. Calling it twice with the same
    /// content leaves the same state behind.
    async fn checkpoint(&self, session: &Session) -> Result<(), SessionError>;

    /// Known sessions, most recently updated first.
    async fn list(&self) -> Result<Vec<SessionInfo>, SessionError>;
}
