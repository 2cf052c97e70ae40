pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlSessionStore;
pub use memory::MemorySessionStore;

use crate::config::Config;
use crate::error::SessionError;
use crate::traits::SessionStore;
use std::sync::Arc;

const MAX_SESSION_ID_LEN: usize = 128;

/// Session ids double as file names, so only a conservative character set
/// is accepted.
pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidId(id.to_string()))
    }
}

pub fn create_session_store(config: &Config, ephemeral: bool) -> Arc<dyn SessionStore> {
    if ephemeral {
        Arc::new(MemorySessionStore::new())
    } else {
        Arc::new(JsonlSessionStore::new(&config.sessions_dir))
    }
}
