//! Archive of delivered batches.
//!
//! Every flushed batch is written as zstd-compressed JSON objects, one per
//! job present in the batch, under an hourly key layout:
//!
//! ```text
//! <directory>/<job>/<organization_id>/<YYYYMMDD>/<HH>/<unix_ms>-<seq>.json.zst
//! ```
//!
//! Files are written through a `.tmp` sibling and renamed into place, so a
//! reader never sees a partial object.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError + use<> {
    let path = path.to_path_buf();
    move |source| ExportError::Io { path, source }
}

#[derive(Debug, Clone)]
pub struct BatchExporter {
    root: PathBuf,
    organization_id: String,
}

impl BatchExporter {
    pub fn new(root: impl Into<PathBuf>, organization_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            organization_id: organization_id.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Object path for the part of batch `seq` (created at `at`) owned by `job`.
    pub fn object_path(&self, job: &str, at: DateTime<Utc>, seq: u64) -> PathBuf {
        self.root
            .join(path_segment(job))
            .join(&self.organization_id)
            .join(at.format("%Y%m%d").to_string())
            .join(at.format("%H").to_string())
            .join(format!("{}-{seq:06}.json.zst", at.timestamp_millis()))
    }

    /// Compresses `json` and writes it to the object path of `job`'s part.
    pub fn write(
        &self,
        job: &str,
        at: DateTime<Utc>,
        seq: u64,
        json: &[u8],
    ) -> Result<PathBuf, ExportError> {
        let path = self.object_path(job, at, seq);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
        }

        let compressed = zstd::encode_all(json, ZSTD_LEVEL).map_err(io_err(&path))?;

        let tmp_path = path.with_extension("zst.tmp");
        let mut file = fs::File::create(&tmp_path).map_err(io_err(&tmp_path))?;
        file.write_all(&compressed).map_err(io_err(&tmp_path))?;
        file.sync_all().map_err(io_err(&tmp_path))?;
        drop(file);

        fs::rename(&tmp_path, &path).map_err(io_err(&path))?;
        Ok(path)
    }
}

/// Job names become one directory level; anything else is replaced.
fn path_segment(job: &str) -> String {
    let segment: String = job
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if segment.is_empty() { "_".to_string() } else { segment }
}
