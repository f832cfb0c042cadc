//! Where source documents come from and where compiled artifacts go.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::CompileError;

/// A structural workflow document as authored.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub id: String,
    pub body: String,
    pub modified: DateTime<Utc>,
}

/// A previously compiled artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub body: String,
    pub modified: DateTime<Utc>,
}

/// Provides source documents by id.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn load(&self, id: &str) -> Result<SourceDocument, CompileError>;
}

/// Persists compiled artifacts keyed by source id.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Artifact>, CompileError>;
    async fn put(&self, id: &str, body: &str) -> Result<(), CompileError>;
}

/// Document ids are file names relative to a root; no traversal.
fn resolve_under(root: &Path, id: &str) -> Result<PathBuf, CompileError> {
    let relative = Path::new(id);
    let safe = !id.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
    if !safe {
        return Err(CompileError::SourceNotFound(id.to_string()));
    }
    Ok(root.join(relative))
}

async fn modified_at(path: &Path) -> Result<DateTime<Utc>, CompileError> {
    let meta = tokio::fs::metadata(path).await?;
    Ok(meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()))
}

/// Reads source documents from a directory.
#[derive(Debug, Clone)]
pub struct FsDocumentSource {
    root: PathBuf,
}

impl FsDocumentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DocumentSource for FsDocumentSource {
    async fn load(&self, id: &str) -> Result<SourceDocument, CompileError> {
        let path = resolve_under(&self.root, id)?;
        let body = match tokio::fs::read_to_string(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CompileError::SourceNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(SourceDocument {
            id: id.to_string(),
            body,
            modified: modified_at(&path).await?,
        })
    }
}

/// Stores compiled artifacts as `<id>.compiled` files in a directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, CompileError> {
        resolve_under(&self.root, &format!("{id}.compiled"))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn get(&self, id: &str) -> Result<Option<Artifact>, CompileError> {
        let path = self.path_for(id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => Ok(Some(Artifact {
                body,
                modified: modified_at(&path).await?,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, id: &str, body: &str) -> Result<(), CompileError> {
        let path = self.path_for(id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        Ok(())
    }
}

/// In-memory document source, mainly for hosts that build documents on the fly.
#[derive(Debug, Default)]
pub struct MemoryDocumentSource {
    docs: RwLock<HashMap<String, SourceDocument>>,
}

impl MemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: impl Into<String>, body: impl Into<String>, modified: DateTime<Utc>) {
        let id = id.into();
        self.docs.write().await.insert(
            id.clone(),
            SourceDocument {
                id,
                body: body.into(),
                modified,
            },
        );
    }
}

#[async_trait]
impl DocumentSource for MemoryDocumentSource {
    async fn load(&self, id: &str) -> Result<SourceDocument, CompileError> {
        self.docs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CompileError::SourceNotFound(id.to_string()))
    }
}

/// In-memory artifact store.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<HashMap<String, Artifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an artifact with an explicit timestamp.
    pub async fn insert(&self, id: impl Into<String>, body: impl Into<String>, modified: DateTime<Utc>) {
        self.artifacts.write().await.insert(
            id.into(),
            Artifact {
                body: body.into(),
                modified,
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.artifacts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.artifacts.read().await.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn get(&self, id: &str) -> Result<Option<Artifact>, CompileError> {
        Ok(self.artifacts.read().await.get(id).cloned())
    }

    async fn put(&self, id: &str, body: &str) -> Result<(), CompileError> {
        self.insert(id, body, Utc::now()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_source_reads_documents() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("txt2img.json"), "{\"a\":1}")
            .await
            .unwrap();

        let source = FsDocumentSource::new(dir.path());
        let doc = source.load("txt2img.json").await.unwrap();
        assert_eq!(doc.body, "{\"a\":1}");

        assert!(matches!(
            source.load("missing.json").await,
            Err(CompileError::SourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn fs_source_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsDocumentSource::new(dir.path());
        assert!(matches!(
            source.load("../etc/passwd").await,
            Err(CompileError::SourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn fs_artifacts_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path().join("nested"));
        assert!(store.get("wf.json").await.unwrap().is_none());

        store.put("wf.json", "compiled").await.unwrap();
        let artifact = store.get("wf.json").await.unwrap().unwrap();
        assert_eq!(artifact.body, "compiled");
    }
}
