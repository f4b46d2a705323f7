use async_trait::async_trait;
use convo_core::{ConvoError, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::metadata::SessionSummary;
use crate::session::Session;

/// Persistence backend for sessions.
///
/// `list_all` skips records that fail to deserialize instead of failing the
/// whole listing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn save(&self, session: &Session) -> Result<()>;
    async fn load(&self, id: &str) -> Result<Option<Session>>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list_all(&self) -> Result<Vec<SessionSummary>>;
}

/// File-based session storage, one JSON document per session, scoped to the
/// current workspace.
pub struct FileStorage {
    workspace_dir: PathBuf,
}

impl FileStorage {
    /// Storage rooted at `<home_dir>/.convo-agent/sessions/<workspace-key>`.
    pub fn new(home_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = home_dir.as_ref().join(".convo-agent").join("sessions");
        let workspace_key = Self::generate_workspace_key()?;

        debug!(
            "FileStorage initialized: base_dir={:?}, workspace_key={}",
            base_dir, workspace_key
        );

        Ok(Self {
            workspace_dir: base_dir.join(workspace_key),
        })
    }

    /// Storage under `HOME_DIR`, falling back to the user's home directory.
    pub fn default_location() -> Result<Self> {
        let home_dir = std::env::var("HOME_DIR").map(PathBuf::from).unwrap_or_else(|_| {
            dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
        });
        Self::new(home_dir)
    }

    /// Storage that writes directly into `dir`.
    pub fn with_workspace_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: dir.into(),
        }
    }

    /// Normalized workspace key: short hash of the full path plus the
    /// directory name.
    fn generate_workspace_key() -> Result<String> {
        let cwd = std::env::current_dir()?;

        let mut hasher = Sha256::new();
        hasher.update(cwd.to_string_lossy().as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        let name = cwd
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workspace");

        let safe_name = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>();

        Ok(format!("{}-{}", &hash[..8], safe_name))
    }

    pub fn get_workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    fn session_path(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ConvoError::StorageError(format!("Invalid session id: {id:?}")));
        }
        Ok(self.workspace_dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl SessionStorage for FileStorage {
    async fn save(&self, session: &Session) -> Result<()> {
        let path = self.session_path(session.id())?;
        fs::create_dir_all(&self.workspace_dir).await?;

        let json = serde_json::to_string_pretty(session)?;
        fs::write(&path, json).await?;

        debug!("Saved session {}", session.id());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Session>> {
        let path = self.session_path(id)?;
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let value: Value = serde_json::from_str(&json)
            .map_err(|e| ConvoError::InvalidSessionData(format!("{id}: {e}")))?;
        Session::from_json(value).map(Some)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.session_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted session {}", id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_all(&self) -> Result<Vec<SessionSummary>> {
        let mut entries = match fs::read_dir(&self.workspace_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let parsed = fs::read_to_string(&path)
                .await
                .map_err(ConvoError::from)
                .and_then(|json| {
                    serde_json::from_str::<Value>(&json)
                        .map_err(|e| ConvoError::InvalidSessionData(e.to_string()))
                })
                .and_then(Session::from_json);

            match parsed {
                Ok(session) => summaries.push(session.get_summary()),
                Err(e) => warn!("Skipping unreadable session record {:?}: {}", path, e),
            }
        }

        Ok(summaries)
    }
}

/// In-process storage holding serialized session records.
#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw record as-is, without validation.
    pub async fn insert_raw(&self, id: impl Into<String>, record: Value) {
        self.records.write().await.insert(id.into(), record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn save(&self, session: &Session) -> Result<()> {
        let record = session.to_json()?;
        self.records
            .write()
            .await
            .insert(session.id().to_string(), record);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Session>> {
        let record = self.records.read().await.get(id).cloned();
        record.map(Session::from_json).transpose()
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<SessionSummary>> {
        let records = self.records.read().await;
        let mut summaries = Vec::with_capacity(records.len());
        for (id, record) in records.iter() {
            match Session::from_json(record.clone()) {
                Ok(session) => summaries.push(session.get_summary()),
                Err(e) => warn!("Skipping malformed session record {}: {}", id, e),
            }
        }
        Ok(summaries)
    }
}
