use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use feed_core::{LogLayout, Sink};
use std::path::Path;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::info;

/// One append-only text file per entity under the layout's log directory.
pub struct FileSink {
    layout: LogLayout,
}

impl FileSink {
    /// Open the sink. The log directory must already exist; the archive
    /// directory is created when missing.
    pub async fn open(layout: LogLayout) -> Result<Self> {
        let meta = tokio::fs::metadata(&layout.log_dir)
            .await
            .with_context(|| format!("log directory {}", layout.log_dir.display()))?;
        if !meta.is_dir() {
            return Err(anyhow!(
                "log directory {} is not a directory",
                layout.log_dir.display()
            ));
        }
        tokio::fs::create_dir_all(&layout.archive_dir)
            .await
            .with_context(|| format!("creating archive directory {}", layout.archive_dir.display()))?;
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn append(&self, entity_id: &str, record: &str) -> Result<()> {
        let path = self.layout.log_path(entity_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let mut line = Vec::with_capacity(record.len() + 1);
        line.extend_from_slice(record.as_bytes());
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn relocate(&self, entity_id: &str, source: &Path, archive: &Path) -> Result<()> {
        tokio::fs::copy(source, archive).await.with_context(|| {
            format!("copying {} to {}", source.display(), archive.display())
        })?;
        info!(entity = entity_id, archive = %archive.display(), "log archived");
        if feed_core::config::metrics_enabled() {
            metrics::counter!("stream_archived_entities_total").increment(1);
        }
        Ok(())
    }
}
