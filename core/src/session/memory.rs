use crate::error::SessionError;
use crate::session::validate_session_id;
use crate::traits::{Session, SessionInfo, SessionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Process-local store; nothing survives a restart.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, (Session, DateTime<Utc>)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, session_id: &str) -> Result<Session, SessionError> {
        validate_session_id(session_id)?;
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .get(session_id)
            .map(|(session, _)| session.clone())
            .unwrap_or_else(|| Session::new(session_id)))
    }

    async fn checkpoint(&self, session: &Session) -> Result<(), SessionError> {
        validate_session_id(&session.id)?;
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.id.clone(), (session.clone(), Utc::now()));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionInfo>, SessionError> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .map(|(session, updated_at)| SessionInfo {
                id: session.id.clone(),
                created_at: session.created_at,
                updated_at: *updated_at,
                message_count: session.len(),
            })
            .collect();
        infos.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(infos)
    }
}
