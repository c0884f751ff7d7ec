//! Local file storage for uploaded diagrams.
//!
//! Files are content addressed: `<root>/<project_id>/<sha256>.<ext>`.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Lowercase hex SHA-256 of `bytes`
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "application/pdf" => "pdf",
        _ => "jpg",
    }
}

#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create upload directory {}", root.display()))?;
        tracing::info!(root = %root.display(), "File store ready");
        Ok(Self { root })
    }

    /// Path (relative to the store root) a document is stored under
    pub fn relative_path(project_id: Uuid, hash: &str, media_type: &str) -> String {
        format!("{}/{}.{}", project_id, hash, extension_for(media_type))
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let rel = Path::new(relative);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            anyhow::bail!("Refusing to resolve path outside the store: {}", relative);
        }
        Ok(self.root.join(rel))
    }

    /// Write bytes; an existing file with the same content is left alone
    pub async fn save(&self, relative: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create project upload directory")?;
        }
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(path = %path.display(), "Stored file already present");
            return Ok(());
        }

        // Write then rename so readers never see a partial file
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move upload into place at {}", path.display()))?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Stored file");
        Ok(())
    }

    pub async fn read(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.resolve(relative)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    /// Best-effort removal: failures are logged and swallowed
    pub async fn remove_quietly(&self, relative: &str) {
        match self.resolve(relative) {
            Ok(path) => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove stored file");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Invalid stored path"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_lowercase_hex_sha256() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn relative_path_uses_hash_and_extension() {
        let project = Uuid::nil();
        assert_eq!(
            FileStore::relative_path(project, "abc", "application/pdf"),
            "00000000-0000-0000-0000-000000000000/abc.pdf"
        );
        assert!(FileStore::relative_path(project, "abc", "image/jpeg").ends_with(".jpg"));
    }

    #[tokio::test]
    async fn save_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();
        let rel = FileStore::relative_path(Uuid::new_v4(), "deadbeef", "image/png");

        store.save(&rel, b"png-bytes").await.unwrap();
        // Second save of the same path is a no-op
        store.save(&rel, b"png-bytes").await.unwrap();
        assert_eq!(store.read(&rel).await.unwrap(), b"png-bytes");

        store.remove_quietly(&rel).await;
        assert!(store.read(&rel).await.is_err());

        // Removing again only logs
        store.remove_quietly(&rel).await;
    }

    #[tokio::test]
    async fn paths_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();
        assert!(store.read("../etc/passwd").await.is_err());
        assert!(store.save("/tmp/evil", b"x").await.is_err());
    }
}
