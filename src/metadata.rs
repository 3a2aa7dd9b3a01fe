//! Persistent resume records.
//!
//! Each task writes a JSON record next to its destination file (at
//! `<file_path>.meta`) so a paused or crashed download can pick up where it
//! stopped. Writes are whole-file; a record that fails to parse for any
//! reason is treated as "no resumable state".
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// One contiguous byte range of the target file.
///
/// `range_start`/`range_end` are inclusive. A file of unknown size is
/// represented by a single sentinel block with both set to -1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// 0-based ordinal of the block within its task.
    pub block_id: u32,
    pub range_start: i64,
    pub range_end: i64,
    /// Bytes written since `range_start`.
    #[serde(default)]
    pub downloaded: i64,
    /// Terminal flag; implies `downloaded == len()`.
    #[serde(default)]
    pub completed: bool,
}

impl BlockRecord {
    /// Range length in bytes; meaningless for the unknown-size sentinel.
    pub fn len(&self) -> i64 {
        self.range_end - self.range_start + 1
    }

    /// Whether this is the open-ended block used when the size is unknown.
    pub fn is_open_ended(&self) -> bool {
        self.range_start < 0
    }
}

/// The persisted state of one download task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub url: String,
    pub file_path: String,
    pub file_name: String,
    /// Total size in bytes; -1 when the server did not announce one.
    pub file_size: i64,
    /// Validator pair captured at probe time, kept as opaque strings.
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub last_modified: String,
    pub max_blocks: u32,
    #[serde(default)]
    pub blocks: Vec<BlockRecord>,
}

/// Path of the resume record belonging to `file_path`.
pub fn meta_path(file_path: &Path) -> PathBuf {
    let mut path = file_path.as_os_str().to_owned();
    path.push(".meta");
    PathBuf::from(path)
}

/// Write the record, replacing any previous content.
pub async fn save(path: &Path, meta: &TaskMeta) -> Result<()> {
    let json = serde_json::to_string_pretty(meta)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

/// Read a record back. `None` on any I/O or parse failure — a truncated or
/// corrupt file simply means the download starts fresh.
pub async fn load(path: &Path) -> Option<TaskMeta> {
    let json = tokio::fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&json).ok()
}

/// Best-effort deletion; reports whether the file was removed.
pub async fn remove(path: &Path) -> bool {
    tokio::fs::remove_file(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_meta() -> TaskMeta {
        TaskMeta {
            url: "https://example.com/path?q=hello&lang=中文".to_string(),
            file_path: r"C:\Users\测试\file (1).zip".to_string(),
            file_name: "file (1).zip".to_string(),
            file_size: 4096,
            etag: r#""W/abc-123""#.to_string(),
            last_modified: "Wed, 21 Oct 2015 07:28:00 GMT".to_string(),
            max_blocks: 8,
            blocks: vec![],
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips_every_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin.meta");

        let meta = sample_meta();
        save(&path, &meta).await.unwrap();

        let loaded = load(&path).await.expect("record should load");
        assert_eq!(loaded, meta);
    }

    #[tokio::test]
    async fn blocks_round_trip_with_progress() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin.meta");

        let mut meta = sample_meta();
        meta.blocks = vec![
            BlockRecord {
                block_id: 0,
                range_start: 0,
                range_end: 2047,
                downloaded: 2048,
                completed: true,
            },
            BlockRecord {
                block_id: 1,
                range_start: 2048,
                range_end: 4095,
                downloaded: 17,
                completed: false,
            },
        ];

        save(&path, &meta).await.unwrap();
        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded.blocks, meta.blocks);
        assert_eq!(loaded.blocks[1].len(), 2048);
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin.meta");
        tokio::fs::write(&path, b"{ definitely not json")
            .await
            .unwrap();
        assert!(load(&path).await.is_none());
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempdir().unwrap();
        assert!(load(&dir.path().join("nope.meta")).await.is_none());
    }

    #[tokio::test]
    async fn remove_is_best_effort() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin.meta");
        save(&path, &sample_meta()).await.unwrap();

        assert!(remove(&path).await);
        assert!(!remove(&path).await);
    }

    #[test]
    fn meta_path_appends_suffix() {
        assert_eq!(
            meta_path(Path::new("/tmp/a/file (1).zip")),
            PathBuf::from("/tmp/a/file (1).zip.meta")
        );
    }
}
