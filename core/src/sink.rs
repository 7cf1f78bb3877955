use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Where per-entity logs live and where finalized ones are archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLayout {
    pub log_dir: PathBuf,
    pub archive_dir: PathBuf,
}

impl LogLayout {
    pub fn new(log_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    /// File name for an entity: its id with the dots removed, `1.201` -> `1201.txt`.
    pub fn file_name(entity_id: &str) -> String {
        format!("{}.txt", entity_id.replace('.', ""))
    }

    pub fn log_path(&self, entity_id: &str) -> PathBuf {
        self.log_dir.join(Self::file_name(entity_id))
    }

    pub fn archive_path(&self, entity_id: &str) -> PathBuf {
        self.archive_dir.join(Self::file_name(entity_id))
    }
}

/// Durable per-entity append log.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Append one record (a single line, no trailing newline) to the log of
    /// `entity_id`.
    async fn append(&self, entity_id: &str, record: &str) -> Result<()>;

    /// Move a finalized entity's log from `source` into the archive at
    /// `archive`.
    async fn relocate(&self, entity_id: &str, source: &Path, archive: &Path) -> Result<()>;
}
