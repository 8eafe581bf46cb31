//! Extraction collaborator boundary.
//!
//! Resolved documents leave the pipeline through a [`DocumentSink`]. The
//! bundled [`SpoolSink`] drops them into a spool directory under their
//! suggested filename, where the extraction service picks them up.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info};

use crate::error::SinkError;
use crate::pipeline::content::sanitize_filename;
use crate::pipeline::types::ResolvedDocument;

/// Where an accepted document ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkReceipt {
    pub filename: String,
    pub location: String,
}

#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Hand one document downstream.
    ///
    /// `SinkError::Unavailable` means the collaborator itself is down and
    /// the run should stop; other errors concern this document only.
    async fn accept(&self, document: &ResolvedDocument) -> Result<SinkReceipt, SinkError>;
}

/// Writes documents into a local spool directory.
pub struct SpoolSink {
    dir: PathBuf,
}

impl SpoolSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the spool directory if missing.
    pub async fn ensure_dir(&self) -> Result<(), SinkError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SinkError::Unavailable(format!("{}: {e}", self.dir.display())))
    }
}

#[async_trait]
impl DocumentSink for SpoolSink {
    async fn accept(&self, document: &ResolvedDocument) -> Result<SinkReceipt, SinkError> {
        if document.is_empty() {
            return Err(SinkError::Rejected {
                filename: document.suggested_filename.clone(),
                reason: "empty payload".into(),
            });
        }

        self.ensure_dir().await?;

        let filename = spool_name(&self.dir, document).await;
        let path = self.dir.join(&filename);
        fs::write(&path, &document.content)
            .await
            .map_err(|source| SinkError::Write {
                path: path.clone(),
                source,
            })?;

        debug!(
            message_id = %document.source_message_id,
            path = %path.display(),
            size = document.len(),
            "Spooled document"
        );
        info!(filename = %filename, origin = ?document.origin, "Document handed to extraction");

        Ok(SinkReceipt {
            filename,
            location: path.display().to_string(),
        })
    }
}

/// Pick the spool filename. Rewriting identical bytes reuses the name; a
/// different document under a taken name gets a hash suffix.
async fn spool_name(dir: &Path, document: &ResolvedDocument) -> String {
    let filename = sanitize_filename(&document.suggested_filename);
    match fs::read(dir.join(&filename)).await {
        Ok(existing) if existing != document.content => {
            let suffix: String = document.content_hash.chars().take(12).collect();
            let renamed = match filename.rsplit_once('.') {
                Some((stem, ext)) => format!("{stem}_{suffix}.{ext}"),
                None => format!("{filename}_{suffix}"),
            };
            debug!(taken = %filename, renamed = %renamed, "Spool name in use by another document");
            renamed
        }
        _ => filename,
    }
}
