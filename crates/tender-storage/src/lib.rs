//! Entity store contract, store implementations, and the input archive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tender_core::{DedupPlan, Employee, Organisation, Pseudonym, RowMutation, Tender};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryEntityStore;
pub use postgres::PgEntityStore;

pub const CRATE_NAME: &str = "tender-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("store query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// Connection-level failures abort a whole run; everything else only the
    /// transaction that hit it.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result of committing one row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutationReceipt {
    pub fields_written: usize,
    pub assignments_created: usize,
    pub organisation_created: bool,
    pub organisation_link_created: bool,
}

impl MutationReceipt {
    pub fn wrote_anything(&self) -> bool {
        self.fields_written > 0 || self.assignments_created > 0 || self.organisation_link_created
    }
}

/// Bulk-loaded, read-only view of the store used for matching.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub tenders: Vec<Tender>,
    pub employees: Vec<Employee>,
}

impl StoreSnapshot {
    pub fn employee_index(&self) -> HashMap<Pseudonym, Employee> {
        self.employees
            .iter()
            .map(|e| (e.pseudonym.clone(), e.clone()))
            .collect()
    }

    pub fn assignment_count(&self) -> usize {
        self.tenders.iter().map(|t| t.employees.len()).sum()
    }
}

/// Transactional store of tenders, organisations and employees.
///
/// `apply_row_mutation` and `apply_dedup_plan` are each one transaction: either
/// every write lands or none does.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn load_snapshot(&self) -> Result<StoreSnapshot, StoreError>;

    async fn find_organisation_by_name(&self, name: &str)
        -> Result<Option<Organisation>, StoreError>;

    async fn apply_row_mutation(&self, mutation: &RowMutation)
        -> Result<MutationReceipt, StoreError>;

    async fn apply_dedup_plan(&self, tender_id: Uuid, plan: &DedupPlan) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct ArchivedInput {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once archive of every spreadsheet export a run read.
#[derive(Debug, Clone)]
pub struct InputArchive {
    root: PathBuf,
}

impl InputArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path_for(
        &self,
        received_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = received_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(day)
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes under their content hash via temp file + rename. Identical
    /// content archived twice on the same day is stored once.
    pub async fn archive_bytes(
        &self,
        received_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedInput> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.relative_path_for(received_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedInput {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    pub async fn archive_file(
        &self,
        received_at: DateTime<Utc>,
        source_id: &str,
        path: &Path,
    ) -> anyhow::Result<ArchivedInput> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading input {}", path.display()))?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_ascii_lowercase();
        self.archive_bytes(received_at, source_id, &extension, &bytes)
            .await
    }
}
