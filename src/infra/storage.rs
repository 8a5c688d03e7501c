//! Filesystem storage for rendered PDFs.
//!
//! Files live at `<root>/<tenant>/<yyyy>-<mm>/<document id>.pdf`. Writes go
//! to a sibling temporary file first and are renamed into place, so a reader
//! never observes a partial PDF.

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid stored path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("document is empty")]
    EmptyPayload,
    #[error("document size exceeds supported range")]
    SizeOverflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPdf {
    /// Path relative to the storage root.
    pub stored_path: String,
    /// Hex-encoded SHA-256 of the file contents.
    pub checksum: String,
    pub size_bytes: i64,
}

#[derive(Debug)]
pub struct DocumentStorage {
    root: PathBuf,
}

impl DocumentStorage {
    /// Storage rooted at `root`, created when missing.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub async fn store_pdf(
        &self,
        tenant_id: &str,
        document_id: Uuid,
        pdf: &Bytes,
    ) -> Result<StoredPdf, StorageError> {
        if pdf.is_empty() {
            return Err(StorageError::EmptyPayload);
        }
        let size_bytes = i64::try_from(pdf.len()).map_err(|_| StorageError::SizeOverflow)?;

        let stored_path = build_stored_path(tenant_id, document_id, OffsetDateTime::now_utc());
        let absolute = self.resolve(&stored_path)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await?;
        }

        let partial = absolute.with_extension("pdf.partial");
        if let Err(err) = write_file(&partial, pdf).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err.into());
        }
        fs::rename(&partial, &absolute).await?;

        Ok(StoredPdf {
            stored_path,
            checksum: hex::encode(Sha256::digest(pdf)),
            size_bytes,
        })
    }

    pub async fn read(&self, stored_path: &str) -> Result<Bytes, StorageError> {
        let absolute = self.resolve(stored_path)?;
        Ok(Bytes::from(fs::read(absolute).await?))
    }

    /// Remove a stored file. Missing files count as removed.
    pub async fn delete(&self, stored_path: &str) -> Result<(), StorageError> {
        let absolute = self.resolve(stored_path)?;
        match fs::remove_file(&absolute).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    fn resolve(&self, stored_path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(stored_path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(StorageError::InvalidPath);
        }

        Ok(self.root.join(relative))
    }
}

async fn write_file(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

fn build_stored_path(tenant_id: &str, document_id: Uuid, now: OffsetDateTime) -> String {
    let tenant = tenant_directory(tenant_id);
    format!(
        "{tenant}/{}-{:02}/{document_id}.pdf",
        now.year(),
        u8::from(now.month())
    )
}

/// Tenant ids are opaque; keep them to one safe path segment.
fn tenant_directory(tenant_id: &str) -> String {
    let cleaned: String = tenant_id
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|ch| ch == '_') {
        "_unknown".to_owned()
    } else {
        cleaned
    }
}
