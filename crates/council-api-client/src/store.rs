//! File-backed [`StateStore`]: one JSON file for the session summary, one per
//! uid for conversation history.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use council_client_core::{ConversationSnapshot, SessionSummary, StateStore, StoreError};

const SESSION_FILE: &str = "session.json";

/// Durable store rooted at a caller-chosen directory. Writes go through a
/// temp file and rename so a crash mid-write never leaves a torn JSON file.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|error| StoreError::new(format!("create {}: {error}", dir.display())))?;
        Ok(Self { dir })
    }

    fn session_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    fn conversation_path(&self, uid: &str) -> PathBuf {
        self.dir.join(format!("conversation-{}.json", sanitize(uid)))
    }
}

/// Uids come from the identity provider and may contain path-hostile
/// characters. Anything outside [A-Za-z0-9_-] becomes an underscore.
fn sanitize(uid: &str) -> String {
    uid.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(StoreError::new(format!(
                "read {}: {error}",
                path.display()
            )));
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|error| StoreError::new(format!("decode {}: {error}", path.display())))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|error| StoreError::new(format!("encode {}: {error}", path.display())))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)
        .map_err(|error| StoreError::new(format!("write {}: {error}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|error| StoreError::new(format!("rename {}: {error}", path.display())))
}

fn remove_file(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(StoreError::new(format!(
            "remove {}: {error}",
            path.display()
        ))),
    }
}

impl StateStore for FileStateStore {
    fn load_session(&self) -> Result<Option<SessionSummary>, StoreError> {
        read_json(&self.session_path())
    }

    fn persist_session(&self, summary: &SessionSummary) -> Result<(), StoreError> {
        write_json(&self.session_path(), summary)
    }

    fn clear_session(&self) -> Result<(), StoreError> {
        remove_file(&self.session_path())
    }

    fn load_conversation(&self, uid: &str) -> Result<Option<ConversationSnapshot>, StoreError> {
        read_json(&self.conversation_path(uid))
    }

    fn persist_conversation(
        &self,
        uid: &str,
        snapshot: &ConversationSnapshot,
    ) -> Result<(), StoreError> {
        write_json(&self.conversation_path(uid), snapshot)
    }

    fn clear_conversation(&self, uid: &str) -> Result<(), StoreError> {
        remove_file(&self.conversation_path(uid))
    }
}
