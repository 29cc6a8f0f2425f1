//! File-backed persistence for documents, operation logs, and exports.
//!
//! Layout under the storage root: `docs/<id>.json` holds the latest
//! document snapshot, `oplogs/<id>.jsonl` an append-only operation log
//! (one JSON operation per line), and `exports/<session>.json` the final
//! exports of torn-down sessions. Recovery loads the snapshot and can
//! replay the log tail; the checksum detects divergence.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use rand::random;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::Identifier;
use crate::lifecycle::SessionExport;
use crate::ot::document::DocumentState;
use crate::ot::operation::Operation;

/// A driver for storage operations rooted at one directory.
#[derive(Debug)]
pub struct Database {
    storage: PathBuf,
}

impl Database {
    /// Opens (creating if needed) a database rooted at `storage`.
    pub async fn new(storage: PathBuf) -> Result<Self> {
        let this = Self { storage };
        fs::create_dir_all(this.docs_dir()).await?;
        fs::create_dir_all(this.oplogs_dir()).await?;
        fs::create_dir_all(this.exports_dir()).await?;
        Ok(this)
    }

    /// A database in a fresh temporary directory, for tests.
    pub async fn temporary() -> Result<Self> {
        let storage = std::env::temp_dir().join(format!("cowrite_{:x}", random::<u64>()));
        Self::new(storage).await
    }

    /// Loads the latest snapshot of a document.
    pub async fn load_document(&self, document_id: &Identifier) -> Result<DocumentState> {
        let path = self.doc_path(document_id);
        if !path.exists() {
            bail!("document '{document_id}' not found");
        }
        let raw = fs::read_to_string(path).await?;
        let document = serde_json::from_str(&raw).context("malformed document snapshot")?;
        Ok(document)
    }

    /// Stores a document snapshot; idempotent, last write wins.
    pub async fn store_document(&self, document: &DocumentState) -> Result<()> {
        let id: Identifier = document.id.parse().context("unsafe document id")?;
        let path = self.doc_path(&id);
        let serialized = serde_json::to_string_pretty(document)?;
        tokio::task::spawn_blocking(move || {
            std::fs::write(path, serialized).context("failed to write document")
        })
        .await??;
        Ok(())
    }

    /// Appends operations to a document's log.
    pub async fn append_operations(&self, document_id: &str, ops: &[Operation]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let id: Identifier = document_id.parse().context("unsafe document id")?;
        let mut lines = String::new();
        for op in ops {
            lines.push_str(&serde_json::to_string(op)?);
            lines.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.oplog_path(&id))
            .await?;
        file.write_all(lines.as_bytes()).await?;
        Ok(())
    }

    /// Operations recorded against `document_id` with a base version at
    /// or after `since_version`, for late joiners and recovery.
    pub async fn load_operation_history(
        &self,
        document_id: &Identifier,
        since_version: u64,
    ) -> Result<Vec<Operation>> {
        let path = self.oplog_path(document_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(path).await?;
        let mut ops = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let op: Operation = serde_json::from_str(line).context("malformed operation log")?;
            if op.metadata.document_version >= since_version {
                ops.push(op);
            }
        }
        Ok(ops)
    }

    /// Stores a session's final export.
    pub async fn store_export(&self, session_id: &Identifier, export: &SessionExport) -> Result<()> {
        let path = self.exports_dir().join(session_id.as_ref()).with_extension("json");
        let serialized = serde_json::to_string_pretty(export)?;
        fs::write(path, serialized).await?;
        Ok(())
    }

    /// Number of persisted document snapshots.
    pub async fn document_count(&self) -> Result<usize> {
        let mut entries = fs::read_dir(self.docs_dir()).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn doc_path(&self, document_id: &Identifier) -> PathBuf {
        self.docs_dir().join(document_id.as_ref()).with_extension("json")
    }

    fn oplog_path(&self, document_id: &Identifier) -> PathBuf {
        self.oplogs_dir().join(document_id.as_ref()).with_extension("jsonl")
    }

    fn docs_dir(&self) -> PathBuf {
        self.storage.join("docs")
    }

    fn oplogs_dir(&self) -> PathBuf {
        self.storage.join("oplogs")
    }

    fn exports_dir(&self) -> PathBuf {
        self.storage.join("exports")
    }
}

#[cfg(test)]
impl Drop for Database {
    fn drop(&mut self) {
        // Clean up temporary storage directories on drop.
        if self.storage.parent() == Some(std::env::temp_dir().as_path()) {
            let _ = std::fs::remove_dir_all(&self.storage);
        }
    }
}
