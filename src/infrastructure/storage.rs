//! Persistence of completed inbound transfers.

use crate::domain::models::TransferKind;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Where finished receive buffers go
pub trait ArtifactStore: Send {
    fn save(
        &mut self,
        kind: TransferKind,
        file_name: Option<&str>,
        bytes: &[u8],
    ) -> Result<PathBuf>;
}

/// Writes each artifact as a file in one directory
pub struct FileArtifactStore {
    dir: PathBuf,
}

impl FileArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name_for(kind: TransferKind, file_name: Option<&str>) -> String {
        // Only keep the final path component of a device-supplied name
        let supplied = file_name
            .and_then(|n| Path::new(n).file_name())
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty());

        match supplied {
            Some(name) => name.to_string(),
            None => {
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or(0);
                format!("{}-{}.{}", kind, millis, kind.extension())
            }
        }
    }

    /// First path that does not exist yet: `name`, `name (1)`, ...
    fn unique_path(&self, name: &str) -> PathBuf {
        let candidate = self.dir.join(name);
        if !candidate.exists() {
            return candidate;
        }

        let path = Path::new(name);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
        let ext = path.extension().and_then(|e| e.to_str());
        (1..)
            .map(|i| match ext {
                Some(ext) => self.dir.join(format!("{} ({}).{}", stem, i, ext)),
                None => self.dir.join(format!("{} ({})", stem, i)),
            })
            .find(|p| !p.exists())
            .unwrap_or(candidate)
    }
}

impl ArtifactStore for FileArtifactStore {
    fn save(
        &mut self,
        kind: TransferKind,
        file_name: Option<&str>,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Could not create {}", self.dir.display()))?;

        let path = self.unique_path(&Self::file_name_for(kind, file_name));
        fs::write(&path, bytes).with_context(|| format!("Could not write {}", path.display()))?;
        info!("Saved {} ({} bytes) to {}", kind, bytes.len(), path.display());
        Ok(path)
    }
}
