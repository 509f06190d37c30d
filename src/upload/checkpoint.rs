//! Resume state of incomplete transfers
//!
//! A checkpoint exists only while a transfer is incomplete. It is keyed by
//! the local file identity (path, length, modification time), so editing the
//! file invalidates it without any explicit bookkeeping.

use super::checksum::LocalFileMeta;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Progress of one block of a multipart transfer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockState {
    /// Offset of the block in the file
    pub offset: u64,
    /// Length of the block in bytes
    pub len: u64,
    /// Remote block checksum, present once the block is transferred
    #[serde(default)]
    pub checksum: Option<String>,
}

impl BlockState {
    /// Whether the block has been transferred
    pub fn is_complete(&self) -> bool {
        self.checksum.is_some()
    }
}

/// Block layout and per-block progress of a multipart transfer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    /// Nominal block size
    pub block_size: u64,
    /// Blocks in file order
    pub blocks: Vec<BlockState>,
}

impl ResumeState {
    /// Fresh state splitting `length` bytes into `block_size` blocks
    ///
    /// An empty file still gets one empty block so the remote side can
    /// assemble it.
    pub fn new(length: u64, block_size: u64) -> Self {
        let block_size = block_size.max(1);
        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset < length {
            let len = block_size.min(length - offset);
            blocks.push(BlockState {
                offset,
                len,
                checksum: None,
            });
            offset += len;
        }
        if blocks.is_empty() {
            blocks.push(BlockState {
                offset: 0,
                len: 0,
                checksum: None,
            });
        }
        Self { block_size, blocks }
    }

    /// Whether the blocks tile `0..length` without gaps or overlap
    pub fn covers(&self, length: u64) -> bool {
        let mut expected = 0;
        for block in &self.blocks {
            if block.offset != expected {
                return false;
            }
            expected += block.len;
        }
        !self.blocks.is_empty() && expected == length
    }

    /// Bytes in completed blocks
    pub fn completed_bytes(&self) -> u64 {
        self.blocks
            .iter()
            .filter(|b| b.is_complete())
            .map(|b| b.len)
            .sum()
    }

    /// Whether every block has been transferred
    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(BlockState::is_complete)
    }

    /// Remote block checksums in file order, if all blocks are complete
    pub fn block_checksums(&self) -> Option<Vec<String>> {
        self.blocks.iter().map(|b| b.checksum.clone()).collect()
    }
}

/// One persisted checkpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Identity of the file, including any hashes computed so far
    pub meta: LocalFileMeta,
    /// Transfer progress; `None` marks a file whose rapid upload was tried
    #[serde(default)]
    pub state: Option<ResumeState>,
    /// Last update, seconds since the Unix epoch
    pub updated_at: i64,
}

/// Store of resume checkpoints
///
/// Implementations synchronize internally; callers never hold locks on the
/// store. Persisted data is best effort and may be stale.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Checkpoint for the file described by `meta`
    ///
    /// Hashes cached with the entry are merged into `meta`.
    fn find(&self, meta: &mut LocalFileMeta) -> Option<CheckpointEntry>;

    /// Insert or replace the checkpoint for `meta`
    fn upsert(&self, meta: &LocalFileMeta, state: Option<ResumeState>);

    /// Remove the checkpoint for `meta`; returns whether one existed
    fn delete(&self, meta: &LocalFileMeta) -> bool;

    /// Write the current entries to durable storage
    async fn persist(&self) -> Result<()>;
}

/// Checkpoint store backed by a JSON file
///
/// Entries live in memory and are written out by [`CheckpointStore::persist`]
/// through a temporary file and a rename, so a crash leaves either the old or
/// the new file.
#[derive(Debug)]
pub struct JsonCheckpointStore {
    path: Option<PathBuf>,
    entries: Mutex<Vec<CheckpointEntry>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonCheckpointStore {
    /// Load the store from `path`; a missing file is an empty store
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Checkpoint(format!(
                    "corrupt checkpoint file {}: {e}",
                    path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::Io(e)),
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "Loaded checkpoint store");

        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(Vec::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of stored checkpoints
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no checkpoint
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CheckpointEntry>> {
        // Entries stay consistent even if a holder panicked mid-update.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    fn find(&self, meta: &mut LocalFileMeta) -> Option<CheckpointEntry> {
        let entries = self.lock();
        let entry = entries.iter().find(|e| e.meta.same_file(meta))?.clone();
        meta.merge_cached_hashes(&entry.meta);
        Some(entry)
    }

    fn upsert(&self, meta: &LocalFileMeta, state: Option<ResumeState>) {
        let entry = CheckpointEntry {
            meta: meta.clone(),
            state,
            updated_at: chrono::Utc::now().timestamp(),
        };
        let mut entries = self.lock();
        match entries.iter_mut().find(|e| e.meta.same_file(meta)) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    fn delete(&self, meta: &LocalFileMeta) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| !e.meta.same_file(meta));
        entries.len() != before
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = self.write_lock.lock().await;
        let json = {
            let entries = self.lock();
            serde_json::to_vec_pretty(&*entries)?
        };

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;

        tracing::trace!(path = %path.display(), "Persisted checkpoints");
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn meta(path: &str, length: u64, mod_time: i64) -> LocalFileMeta {
        LocalFileMeta {
            path: PathBuf::from(path),
            length,
            mod_time,
            ..LocalFileMeta::default()
        }
    }

    #[test]
    fn new_state_tiles_the_file() {
        let state = ResumeState::new(10, 4);
        let lens: Vec<u64> = state.blocks.iter().map(|b| b.len).collect();
        assert_eq!(lens, [4, 4, 2]);
        assert!(state.covers(10));
        assert!(!state.covers(11));
        assert_eq!(state.completed_bytes(), 0);
    }

    #[test]
    fn empty_file_gets_one_empty_block() {
        let state = ResumeState::new(0, 4 * 1024 * 1024);
        assert_eq!(state.blocks.len(), 1);
        assert!(state.covers(0));
    }

    #[test]
    fn completion_tracks_block_checksums() {
        let mut state = ResumeState::new(8, 4);
        state.blocks[1].checksum = Some("b".into());
        assert_eq!(state.completed_bytes(), 4);
        assert!(!state.is_complete());
        assert!(state.block_checksums().is_none());

        state.blocks[0].checksum = Some("a".into());
        assert!(state.is_complete());
        assert_eq!(state.block_checksums().unwrap(), ["a", "b"]);
    }

    #[test]
    fn find_matches_identity_and_merges_hashes() {
        let store = JsonCheckpointStore::in_memory();
        let mut with_hash = meta("/a", 10, 1);
        with_hash.md5 = Some([9; 16]);
        store.upsert(&with_hash, Some(ResumeState::new(10, 4)));

        let mut lookup = meta("/a", 10, 1);
        let entry = store.find(&mut lookup).unwrap();
        assert_eq!(entry.state.unwrap().blocks.len(), 3);
        assert_eq!(lookup.md5, Some([9; 16]));

        assert!(store.find(&mut meta("/a", 10, 2)).is_none(), "modified file");
        assert!(store.find(&mut meta("/a", 11, 1)).is_none(), "resized file");
    }

    #[test]
    fn upsert_replaces_and_delete_removes() {
        let store = JsonCheckpointStore::in_memory();
        let m = meta("/a", 10, 1);
        store.upsert(&m, None);
        store.upsert(&m, Some(ResumeState::new(10, 5)));
        assert_eq!(store.len(), 1);

        assert!(store.delete(&m));
        assert!(!store.delete(&m));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("uploading.json");

        let store = JsonCheckpointStore::open(&path).await.unwrap();
        assert!(store.is_empty());
        let mut state = ResumeState::new(10, 4);
        state.blocks[0].checksum = Some("abc".into());
        store.upsert(&meta("/a", 10, 1), Some(state.clone()));
        store.persist().await.unwrap();

        let reloaded = JsonCheckpointStore::open(&path).await.unwrap();
        let entry = reloaded.find(&mut meta("/a", 10, 1)).unwrap();
        assert_eq!(entry.state, Some(state));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uploading.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = JsonCheckpointStore::open(&path).await.unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn in_memory_persist_is_a_no_op() {
        let store = JsonCheckpointStore::in_memory();
        store.upsert(&meta("/a", 1, 1), None);
        store.persist().await.unwrap();
        assert!(store.path().is_none());
    }
}
