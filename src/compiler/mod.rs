//! Workflow compiler: structural conversion with a cache-or-recompute fast path.
//!
//! A source document is converted into its final dispatchable form once
//! and the artifact is persisted. The artifact is reused while it is newer
//! than the source. When conversion is unavailable or fails, the source is
//! used as-is so a step is never blocked on the conversion capability.
//!
//! Variable bindings are not part of the cached artifact; they are
//! substituted per dispatch by [`placeholders::substitute`].

pub mod placeholders;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::CompilerConfig;
use crate::error::CompileError;

pub use store::{
    Artifact, ArtifactStore, DocumentSource, FsArtifactStore, FsDocumentSource,
    MemoryArtifactStore, MemoryDocumentSource, SourceDocument,
};

/// Converts a structural source document into its final form.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, source: &SourceDocument) -> Result<String, CompileError>;
}

/// Converter backed by a remote HTTP conversion endpoint.
///
/// POSTs the source body and takes the response body as the artifact.
pub struct HttpConverter {
    client: reqwest::Client,
    url: String,
}

impl HttpConverter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Converter for HttpConverter {
    async fn convert(&self, source: &SourceDocument) -> Result<String, CompileError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(source.body.clone())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CompileError::ConversionFailed {
                id: source.id.clone(),
                reason: format!("converter returned {status}: {body}"),
            });
        }
        Ok(body)
    }
}

/// How a compiled document was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileOrigin {
    /// Reused a persisted artifact newer than the source.
    Cached,
    /// Freshly converted and persisted.
    Compiled,
    /// Conversion unavailable or failed; the source is used verbatim.
    Passthrough,
}

/// A document ready for placeholder substitution.
#[derive(Debug, Clone)]
pub struct CompiledDocument {
    pub id: String,
    pub body: Arc<str>,
    pub origin: CompileOrigin,
}

/// Compiles workflow documents with artifact caching.
pub struct WorkflowCompiler {
    source: Arc<dyn DocumentSource>,
    artifacts: Arc<dyn ArtifactStore>,
    converter: Option<Arc<dyn Converter>>,
    /// Artifacts already resolved in this process, keyed by source id and source mtime.
    memo: RwLock<HashMap<(String, DateTime<Utc>), Arc<str>>>,
}

impl WorkflowCompiler {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        artifacts: Arc<dyn ArtifactStore>,
        converter: Option<Arc<dyn Converter>>,
    ) -> Self {
        Self {
            source,
            artifacts,
            converter,
            memo: RwLock::new(HashMap::new()),
        }
    }

    /// Filesystem-backed compiler from configuration.
    pub fn from_config(config: &CompilerConfig) -> Self {
        let converter: Option<Arc<dyn Converter>> = config
            .converter_url
            .as_ref()
            .map(|url| Arc::new(HttpConverter::new(url.clone())) as Arc<dyn Converter>);
        Self::new(
            Arc::new(FsDocumentSource::new(&config.template_dir)),
            Arc::new(FsArtifactStore::new(&config.artifact_dir)),
            converter,
        )
    }

    /// Compiler that never converts: every source is its own final form.
    pub fn passthrough(source: Arc<dyn DocumentSource>) -> Self {
        Self::new(source, Arc::new(MemoryArtifactStore::new()), None)
    }

    /// Produce the final document for `id`.
    ///
    /// Fails only when the source document itself cannot be loaded.
    pub async fn compile(&self, id: &str) -> Result<CompiledDocument, CompileError> {
        let source = self.source.load(id).await?;
        let key = (source.id.clone(), source.modified);

        if let Some(body) = self.memo.read().await.get(&key).cloned() {
            debug!(document = id, "Compiled document served from memo");
            return Ok(CompiledDocument {
                id: id.to_string(),
                body,
                origin: CompileOrigin::Cached,
            });
        }

        match self.artifacts.get(id).await {
            Ok(Some(artifact)) if artifact.modified > source.modified => {
                debug!(document = id, "Reusing compiled artifact");
                let body: Arc<str> = artifact.body.into();
                self.memo.write().await.insert(key, body.clone());
                return Ok(CompiledDocument {
                    id: id.to_string(),
                    body,
                    origin: CompileOrigin::Cached,
                });
            }
            Ok(_) => {}
            Err(e) => warn!(document = id, error = %e, "Artifact lookup failed, recompiling"),
        }

        let Some(converter) = &self.converter else {
            debug!(document = id, "No converter configured, using source as-is");
            return Ok(Self::passthrough_of(source));
        };

        match converter.convert(&source).await {
            Ok(body) => {
                if let Err(e) = self.artifacts.put(id, &body).await {
                    warn!(document = id, error = %e, "Failed to persist compiled artifact");
                }
                info!(document = id, "Compiled workflow document");
                let body: Arc<str> = body.into();
                self.memo.write().await.insert(key, body.clone());
                Ok(CompiledDocument {
                    id: id.to_string(),
                    body,
                    origin: CompileOrigin::Compiled,
                })
            }
            Err(e) => {
                warn!(document = id, error = %e, "Conversion failed, using source as-is");
                Ok(Self::passthrough_of(source))
            }
        }
    }

    fn passthrough_of(source: SourceDocument) -> CompiledDocument {
        CompiledDocument {
            id: source.id,
            body: source.body.into(),
            origin: CompileOrigin::Passthrough,
        }
    }
}
