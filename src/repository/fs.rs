use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};

use super::ArtifactStore;

/// Writes artifacts below a root directory, creating parents as needed.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rejects absolute paths and `..` so writes stay under the root.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let rel = Path::new(relative);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("artifact path `{relative}` escapes the artifact root");
        }
        Ok(self.root.join(rel))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<String> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&full, bytes).with_context(|| format!("failed to write {}", full.display()))?;
        tracing::debug!(path = %full.display(), size = bytes.len(), "artifact written");
        Ok(full.to_string_lossy().into_owned())
    }
}
