use crate::error::SessionError;
use crate::session::validate_session_id;
use crate::traits::{ChatMessage, Session, SessionInfo, SessionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

const METADATA_TYPE: &str = "metadata";

/// First line of every session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionMetadata {
    #[serde(rename = "_type")]
    type_field: String,
    session_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    message_count: usize,
}

/// One `<id>.jsonl` file per session: a metadata line followed by one line
/// per message, in append order.
pub struct JsonlSessionStore {
    sessions_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JsonlSessionStore {
    pub fn new(sessions_dir: impl AsRef<Path>) -> Self {
        Self {
            sessions_dir: sessions_dir.as_ref().to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.jsonl"))
    }

    fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drops the map entry once no other caller holds or waits on it.
    fn release(&self, session_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(session_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(session_id);
        }
    }

    async fn read_session(&self, session_id: &str) -> Result<Session, SessionError> {
        let path = self.session_path(session_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let session = self.parse(session_id, &path, &contents)?;
                tracing::debug!(
                    session_id,
                    messages = session.len(),
                    "Loaded session from {}",
                    path.display()
                );
                Ok(session)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Session::new(session_id)),
            Err(source) => Err(SessionError::Io { path, source }),
        }
    }

    async fn write_session(&self, session: &Session) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.sessions_dir)
            .await
            .map_err(|source| SessionError::Io {
                path: self.sessions_dir.clone(),
                source,
            })?;

        let meta = SessionMetadata {
            type_field: METADATA_TYPE.into(),
            session_id: session.id.clone(),
            created_at: session.created_at,
            updated_at: Utc::now(),
            message_count: session.len(),
        };

        let mut buf = serde_json::to_string(&meta)?;
        buf.push('\n');
        for msg in session.messages() {
            buf.push_str(&serde_json::to_string(msg)?);
            buf.push('\n');
        }

        let path = self.session_path(&session.id);
        let tmp_path = self.sessions_dir.join(format!(".{}.jsonl.tmp", session.id));
        let tmp_err = |source| SessionError::Io {
            path: tmp_path.clone(),
            source,
        };

        // The rename must only ever expose fully written bytes.
        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(tmp_err)?;
        file.write_all(buf.as_bytes()).await.map_err(tmp_err)?;
        file.sync_all().await.map_err(tmp_err)?;
        drop(file);

        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|source| SessionError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(())
    }

    fn parse(&self, session_id: &str, path: &Path, contents: &str) -> Result<Session, SessionError> {
        let mut created_at = None;
        let mut messages = Vec::new();

        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let corrupt = |source| SessionError::Corrupt {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            };

            if created_at.is_none() && messages.is_empty() {
                let value: serde_json::Value = serde_json::from_str(line).map_err(corrupt)?;
                if value.get("_type").and_then(|v| v.as_str()) == Some(METADATA_TYPE) {
                    let meta: SessionMetadata = serde_json::from_value(value).map_err(corrupt)?;
                    created_at = Some(meta.created_at);
                    continue;
                }
            }

            messages.push(serde_json::from_str::<ChatMessage>(line).map_err(corrupt)?);
        }

        Ok(Session::with_messages(
            session_id,
            created_at.unwrap_or_else(Utc::now),
            messages,
        ))
    }

    async fn read_metadata(path: &Path) -> Option<SessionMetadata> {
        let file = tokio::fs::File::open(path).await.ok()?;
        let mut reader = tokio::io::BufReader::new(file);
        let mut first_line = String::new();
        reader.read_line(&mut first_line).await.ok()?;
        serde_json::from_str(first_line.trim()).ok()
    }
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn load(&self, session_id: &str) -> Result<Session, SessionError> {
        validate_session_id(session_id)?;
        let lock = self.lock_for(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.read_session(session_id).await
        };
        self.release(session_id, lock);
        result
    }

    async fn checkpoint(&self, session: &Session) -> Result<(), SessionError> {
        validate_session_id(&session.id)?;
        let lock = self.lock_for(&session.id);
        let result = {
            let _guard = lock.lock().await;
            self.write_session(session).await
        };
        self.release(&session.id, lock);
        result
    }

    async fn list(&self) -> Result<Vec<SessionInfo>, SessionError> {
        let mut entries = match tokio::fs::read_dir(&self.sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SessionError::Io {
                    path: self.sessions_dir.clone(),
                    source,
                });
            }
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| SessionError::Io {
                path: self.sessions_dir.clone(),
                source,
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }

            match Self::read_metadata(&path).await {
                Some(meta) if meta.type_field == METADATA_TYPE => sessions.push(SessionInfo {
                    id: meta.session_id,
                    created_at: meta.created_at,
                    updated_at: meta.updated_at,
                    message_count: meta.message_count,
                }),
                _ => tracing::warn!("Skipping session file without metadata: {}", path.display()),
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }
}
