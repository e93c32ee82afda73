//! Stores the original order document under a dated tree.
//!
//! Layout: `{base}/{YYYY}/{MM}/{origin_code}_{YYYY-MM-DD_HH-MM}.pdf`. The
//! timestamp is the message date, so archiving the same candidate twice
//! lands on the same file. Callers treat failures as non-fatal.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{info, warn};

use crate::error::ArchiveError;

/// Writes order documents under a base directory.
#[derive(Debug, Clone)]
pub struct Archiver {
    base: PathBuf,
}

impl Archiver {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path relative to the archive root, always `/`-separated.
    pub fn relative_path(origin_code: &str, date: DateTime<Utc>) -> Result<String, ArchiveError> {
        let name = sanitize(origin_code)?;
        Ok(format!(
            "{}/{}_{}.pdf",
            date.format("%Y/%m"),
            name,
            date.format("%Y-%m-%d_%H-%M")
        ))
    }

    /// Write `bytes` and return the relative path recorded on the order.
    pub async fn archive(
        &self,
        origin_code: &str,
        date: DateTime<Utc>,
        bytes: &[u8],
    ) -> Result<String, ArchiveError> {
        let relative = Self::relative_path(origin_code, date)?;
        let full = self.base.join(&relative);

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| ArchiveError::Write {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        fs::write(&full, bytes)
            .await
            .map_err(|source| ArchiveError::Write {
                path: full.display().to_string(),
                source,
            })?;

        info!(origin_code, path = %relative, bytes = bytes.len(), "Archived order document");
        Ok(relative)
    }

    /// Archive, logging instead of failing.
    pub async fn archive_or_warn(
        &self,
        origin_code: &str,
        date: DateTime<Utc>,
        bytes: &[u8],
    ) -> Option<String> {
        match self.archive(origin_code, date, bytes).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(origin_code, error = %e, "Failed to archive order document");
                None
            }
        }
    }

    /// Remove a document written for an order that was never committed.
    pub async fn discard(&self, relative: &str) {
        let full = self.base.join(relative);
        match fs::remove_file(&full).await {
            Ok(()) => info!(path = %relative, "Discarded archived document"),
            Err(e) => warn!(path = %full.display(), error = %e, "Failed to discard archived document"),
        }
    }
}

/// Make an origin code safe as a file name component.
fn sanitize(origin_code: &str) -> Result<String, ArchiveError> {
    let name: String = origin_code
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.trim_matches('_').is_empty() {
        return Err(ArchiveError::InvalidName(origin_code.to_string()));
    }
    Ok(name)
}
