use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use super::{Batch, CollectContext, CollectError};

/// Appends each batch to a local gzip file as NDJSON instead of sending it
/// to the backend. Every batch becomes one gzip member, so the file stays
/// readable as a single multi-member stream.
#[derive(Debug, Clone)]
pub struct GzipFileStrategy {
    path: PathBuf,
}

impl GzipFileStrategy {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn name(&self) -> &str {
        "gzip_file"
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn deliver(
        &self,
        batch: &Batch<'_>,
        ctx: &CollectContext<'_>,
    ) -> Result<bool, CollectError> {
        let mut lines = Vec::new();
        for record in &batch.records {
            serde_json::to_writer(&mut lines, record)?;
            lines.push(b'\n');
        }

        let path = self.path.clone();
        let bytes = lines.len();
        tokio::task::spawn_blocking(move || append_member(&path, &lines))
            .await
            .map_err(|e| CollectError::Io {
                path: self.path.clone(),
                source: io::Error::other(e),
            })?
            .map_err(|source| CollectError::Io {
                path: self.path.clone(),
                source,
            })?;

        debug!(
            source = ctx.source,
            path = %self.path.display(),
            records = batch.records.len(),
            bytes,
            "appended batch to gzip file",
        );
        Ok(true)
    }
}

fn append_member(path: &Path, data: &[u8]) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(data)?;
    encoder.finish()?.sync_data()
}
