//! Per-job artifact storage.
//!
//! Artifacts are named text blobs keyed by job id and name (`analyst.md`,
//! `manifest.json`). Sources (transcripts) are read from a separate inbox by key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use scriptorium_core::JobId;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("invalid artifact name: {0}")]
    InvalidName(String),

    #[error("artifact storage error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn write(&self, job_id: JobId, name: &str, content: &str) -> Result<(), ArtifactError>;

    /// `None` when the artifact was never written.
    async fn read(&self, job_id: JobId, name: &str) -> Result<Option<String>, ArtifactError>;

    async fn read_source(&self, source: &str) -> Result<String, ArtifactError>;
}

#[async_trait]
impl<S> ArtifactStore for std::sync::Arc<S>
where
    S: ArtifactStore + ?Sized,
{
    async fn write(&self, job_id: JobId, name: &str, content: &str) -> Result<(), ArtifactError> {
        (**self).write(job_id, name, content).await
    }

    async fn read(&self, job_id: JobId, name: &str) -> Result<Option<String>, ArtifactError> {
        (**self).read(job_id, name).await
    }

    async fn read_source(&self, source: &str) -> Result<String, ArtifactError> {
        (**self).read_source(source).await
    }
}

/// Names are single path components: no separators, no `..`.
fn check_name(name: &str) -> Result<(), ArtifactError> {
    let bad = name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\');
    if bad {
        return Err(ArtifactError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Filesystem layout: `<root>/job-<id>/<name>`, sources at `<inbox>/<key>`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
    inbox: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>, inbox: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inbox: inbox.into(),
        }
    }

    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(format!("job-{job_id}"))
    }

    fn artifact_path(&self, job_id: JobId, name: &str) -> Result<PathBuf, ArtifactError> {
        check_name(name)?;
        Ok(self.job_dir(job_id).join(name))
    }

    fn source_path(&self, source: &str) -> Result<PathBuf, ArtifactError> {
        check_name(source)?;
        Ok(self.inbox.join(source))
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, ArtifactError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn write(&self, job_id: JobId, name: &str, content: &str) -> Result<(), ArtifactError> {
        let path = self.artifact_path(job_id, name)?;
        tokio::fs::create_dir_all(self.job_dir(job_id)).await?;

        // Write-then-rename so a reader never sees a half-written artifact.
        let tmp = path.with_file_name(format!("{name}.partial"));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(job_id = %job_id, artifact = %name, bytes = content.len(), "artifact written");
        Ok(())
    }

    async fn read(&self, job_id: JobId, name: &str) -> Result<Option<String>, ArtifactError> {
        read_optional(&self.artifact_path(job_id, name)?).await
    }

    async fn read_source(&self, source: &str) -> Result<String, ArtifactError> {
        read_optional(&self.source_path(source)?)
            .await?
            .ok_or_else(|| ArtifactError::SourceNotFound(source.to_string()))
    }
}

#[derive(Debug, Default)]
struct Contents {
    sources: HashMap<String, String>,
    artifacts: HashMap<(JobId, String), String>,
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    inner: RwLock<Contents>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&self, key: impl Into<String>, content: impl Into<String>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.sources.insert(key.into(), content.into());
        }
    }

    /// Drop an artifact, as if it had been lost from storage.
    pub fn remove(&self, job_id: JobId, name: &str) -> Option<String> {
        self.inner
            .write()
            .ok()
            .and_then(|mut inner| inner.artifacts.remove(&(job_id, name.to_string())))
    }

    /// Artifact names written for one job, sorted.
    pub fn names(&self, job_id: JobId) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .map(|inner| {
                inner
                    .artifacts
                    .keys()
                    .filter(|(id, _)| *id == job_id)
                    .map(|(_, name)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn poisoned() -> ArtifactError {
    ArtifactError::Io(std::io::Error::other("artifact store lock poisoned"))
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn write(&self, job_id: JobId, name: &str, content: &str) -> Result<(), ArtifactError> {
        check_name(name)?;
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner
            .artifacts
            .insert((job_id, name.to_string()), content.to_string());
        Ok(())
    }

    async fn read(&self, job_id: JobId, name: &str) -> Result<Option<String>, ArtifactError> {
        check_name(name)?;
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.artifacts.get(&(job_id, name.to_string())).cloned())
    }

    async fn read_source(&self, source: &str) -> Result<String, ArtifactError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        inner
            .sources
            .get(source)
            .cloned()
            .ok_or_else(|| ArtifactError::SourceNotFound(source.to_string()))
    }
}
