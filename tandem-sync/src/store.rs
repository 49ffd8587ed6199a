//! Offline baseline persistence and authoritative document fetches.
//!
//! ```text
//! Online ──► Offline     BaselineStore::save(text at disconnect)
//! Offline ──► Online     DocumentSource::fetch(doc) ─► compare ─► BaselineStore::clear
//! ```
//!
//! The baseline is persisted so that a restart while offline still
//! reconciles against the text the document had when connectivity was lost.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::StoreError;

/// Text captured when connectivity was lost. Used for exactly one
/// reconciliation, then discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineBaseline {
    pub document_id: String,
    pub text: String,
    pub captured_at: u64,
}

/// The server's authoritative copy of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDocument {
    #[serde(alias = "content")]
    pub text: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, document_id: &str) -> Result<ServerDocument, StoreError>;
}

#[async_trait]
pub trait BaselineStore: Send + Sync {
    async fn save(&self, baseline: &OfflineBaseline) -> Result<(), StoreError>;
    async fn load(&self, document_id: &str) -> Result<Option<OfflineBaseline>, StoreError>;
    async fn clear(&self, document_id: &str) -> Result<(), StoreError>;
}

/// In-process baseline store.
#[derive(Default)]
pub struct MemoryBaselineStore {
    baselines: Mutex<HashMap<String, OfflineBaseline>>,
}

impl MemoryBaselineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.baselines.lock().await.len()
    }
}

#[async_trait]
impl BaselineStore for MemoryBaselineStore {
    async fn save(&self, baseline: &OfflineBaseline) -> Result<(), StoreError> {
        self.baselines
            .lock()
            .await
            .insert(baseline.document_id.clone(), baseline.clone());
        Ok(())
    }

    async fn load(&self, document_id: &str) -> Result<Option<OfflineBaseline>, StoreError> {
        Ok(self.baselines.lock().await.get(document_id).cloned())
    }

    async fn clear(&self, document_id: &str) -> Result<(), StoreError> {
        self.baselines.lock().await.remove(document_id);
        Ok(())
    }
}

/// One JSON file per document under a directory.
pub struct FileBaselineStore {
    dir: PathBuf,
}

impl FileBaselineStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, document_id: &str) -> PathBuf {
        let name: String = document_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.baseline.json"))
    }
}

#[async_trait]
impl BaselineStore for FileBaselineStore {
    async fn save(&self, baseline: &OfflineBaseline) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&baseline.document_id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(baseline)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, document_id: &str) -> Result<Option<OfflineBaseline>, StoreError> {
        match tokio::fs::read(self.path_for(document_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self, document_id: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(document_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fetches `GET {base}/api/documents/{id}` as JSON.
pub struct HttpDocumentSource {
    base: String,
    client: reqwest::Client,
}

impl HttpDocumentSource {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl DocumentSource for HttpDocumentSource {
    async fn fetch(&self, document_id: &str) -> Result<ServerDocument, StoreError> {
        let url = format!("{}/api/documents/{}", self.base, document_id);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(document_id.to_string()));
        }
        Ok(response.error_for_status()?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline(doc: &str, text: &str) -> OfflineBaseline {
        OfflineBaseline {
            document_id: doc.into(),
            text: text.into(),
            captured_at: 1,
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryBaselineStore::new();
        store.save(&baseline("d", "A")).await.unwrap();
        assert_eq!(store.load("d").await.unwrap(), Some(baseline("d", "A")));
        store.clear("d").await.unwrap();
        assert_eq!(store.load("d").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        FileBaselineStore::new(dir.path())
            .save(&baseline("doc/1", "A"))
            .await
            .unwrap();

        let reopened = FileBaselineStore::new(dir.path());
        assert_eq!(reopened.load("doc/1").await.unwrap(), Some(baseline("doc/1", "A")));

        reopened.clear("doc/1").await.unwrap();
        assert_eq!(reopened.load("doc/1").await.unwrap(), None);
        reopened.clear("doc/1").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBaselineStore::new(dir.path());
        tokio::fs::write(store.path_for("d"), b"{not json").await.unwrap();
        assert!(matches!(store.load("d").await, Err(StoreError::Json(_))));
    }

    #[test]
    fn test_server_document_accepts_content_alias() {
        let doc: ServerDocument = serde_json::from_str(r#"{"content": "A C"}"#).unwrap();
        assert_eq!(doc.text, "A C");
        assert!(doc.tags.is_empty());
    }
}
