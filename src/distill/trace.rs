//! Distillation traces and their archive.
//!
//! Bronze appends a trace for every successful job. The pipeline reads traces
//! past its cursor and, when an archive directory is configured, writes the
//! consumed batch to a zstd-compressed JSON-lines segment.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::events::unix_millis;
use crate::registry::descriptor::TierId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillationTrace {
    /// Position in the store; assigned on append.
    #[serde(default)]
    pub seq: u64,
    pub source_tier: TierId,
    pub prompt: String,
    pub response: String,
    pub quality_score: f64,
    pub timestamp: u64,
}

impl DistillationTrace {
    pub fn new(source_tier: TierId, prompt: String, response: String, quality_score: f64) -> Self {
        Self {
            seq: 0,
            source_tier,
            prompt,
            response,
            quality_score,
            timestamp: unix_millis(),
        }
    }
}

/// Append-only in-memory trace log.
#[derive(Default)]
pub struct TraceStore {
    traces: RwLock<Vec<DistillationTrace>>,
    next_seq: AtomicU64,
}

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a trace and return its sequence number.
    pub fn append(&self, mut trace: DistillationTrace) -> u64 {
        let mut traces = self.traces.write();
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        trace.seq = seq;
        traces.push(trace);
        seq
    }

    /// Traces with `seq >= cursor`, in append order.
    pub fn since(&self, cursor: u64) -> Vec<DistillationTrace> {
        let traces = self.traces.read();
        let start = traces.partition_point(|t| t.seq < cursor);
        traces[start..].to_vec()
    }

    /// Sequence number the next append will get.
    pub fn watermark(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.traces.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Trace encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Archive segment not found: {0}")]
    NotFound(PathBuf),
}

/// Writes trace batches as `.jsonl.zst` segments.
pub struct TraceArchive {
    dir: PathBuf,
    level: i32,
}

impl TraceArchive {
    pub async fn new(dir: PathBuf, level: i32) -> Result<Self, ArchiveError> {
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir, level })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write_segment(
        &self,
        traces: &[DistillationTrace],
    ) -> Result<PathBuf, ArchiveError> {
        let mut lines = Vec::new();
        for trace in traces {
            serde_json::to_writer(&mut lines, trace)?;
            lines.push(b'\n');
        }
        let compressed = zstd::encode_all(lines.as_slice(), self.level)?;

        let first = traces.first().map(|t| t.seq).unwrap_or(0);
        let path = self
            .dir
            .join(format!("traces-{}-{first:010}.jsonl.zst", unix_millis()));
        fs::write(&path, &compressed).await?;

        debug!(
            path = %path.display(),
            traces = traces.len(),
            raw = lines.len(),
            compressed = compressed.len(),
            "Wrote trace segment"
        );
        Ok(path)
    }

    pub async fn read_segment(&self, path: &Path) -> Result<Vec<DistillationTrace>, ArchiveError> {
        if !fs::try_exists(path).await? {
            return Err(ArchiveError::NotFound(path.to_path_buf()));
        }
        let compressed = fs::read(path).await?;
        let raw = zstd::decode_all(compressed.as_slice())?;

        let mut traces = Vec::new();
        for line in raw.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
            traces.push(serde_json::from_slice(line)?);
        }
        Ok(traces)
    }

    /// Segment files, oldest first.
    pub async fn segments(&self) -> Result<Vec<PathBuf>, ArchiveError> {
        let mut out = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.to_string_lossy().ends_with(".jsonl.zst") {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn trace(prompt: &str, quality: f64) -> DistillationTrace {
        DistillationTrace::new(TierId::Bronze, prompt.into(), "reply".into(), quality)
    }

    #[test]
    fn test_store_cursor() {
        let store = TraceStore::new();
        store.append(trace("a", 0.9));
        store.append(trace("b", 0.5));
        let cursor = store.watermark();
        store.append(trace("c", 0.8));

        assert_eq!(store.since(0).len(), 3);
        let fresh = store.since(cursor);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].prompt, "c");
        assert_eq!(fresh[0].seq, 2);
    }

    #[tokio::test]
    async fn test_archive_segment_readback() {
        let tmp = TempDir::new().unwrap();
        let archive = TraceArchive::new(tmp.path().join("traces"), 3).await.unwrap();

        let batch = vec![trace("hello", 0.9), trace("bye", 0.8)];
        let path = archive.write_segment(&batch).await.unwrap();
        assert!(path.exists());

        let read = archive.read_segment(&path).await.unwrap();
        assert_eq!(read, batch);
        assert_eq!(archive.segments().await.unwrap(), vec![path]);
    }

    #[tokio::test]
    async fn test_missing_segment() {
        let tmp = TempDir::new().unwrap();
        let archive = TraceArchive::new(tmp.path().to_path_buf(), 3).await.unwrap();
        let err = archive
            .read_segment(&tmp.path().join("nope.jsonl.zst"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound(_)));
    }
}
