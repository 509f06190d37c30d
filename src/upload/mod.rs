//! Upload of local files to remote storage
//!
//! An [`UploadTask`] moves one file through up to three stages:
//!
//! 1. **Init**: open the file and look for a checkpoint of an earlier attempt.
//! 2. **Rapid upload**: hash the file and ask the server to create the target
//!    from content it already holds. A remote entry with the same name and
//!    MD5 ends the task without sending a byte.
//! 3. **Upload**: resumable multipart transfer, seeded from the checkpoint.
//!
//! A run may start at a later stage: a checkpoint, cached hashes from a
//! previous attempt, a disabled rapid upload, or a file above
//! [`MAX_RAPID_UPLOAD_SIZE`] all skip straight to the multipart transfer.

pub mod checkpoint;
pub mod checksum;
pub mod multipart;
pub mod policy;
pub mod remote;
mod task;

pub use checkpoint::{BlockState, CheckpointEntry, CheckpointStore, JsonCheckpointStore, ResumeState};
pub use checksum::{Checksums, LocalFile, LocalFileMeta};
pub use multipart::{MultiUploader, MultipartConfig, READ_CHUNK_SIZE, TransferStatus};
pub use policy::{FailurePolicy, classify};
pub use remote::{BlockBody, RapidUploadHashes, RemoteEntry, StorageClient};
pub use task::{UploadContext, UploadStep, UploadTask};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const MIB: u64 = 1024 * 1024;

/// Largest file the server accepts for rapid upload (20 GiB)
pub const MAX_RAPID_UPLOAD_SIZE: u64 = 20 * 1024 * MIB;

/// Files at least this large get a notice before hashing (128 MiB)
pub const LARGE_FILE_HINT_SIZE: u64 = 128 * MIB;

/// Smallest block of a split upload
pub const MIN_BLOCK_SIZE: u64 = 4 * MIB;

/// Largest block of a split upload
pub const MAX_BLOCK_SIZE: u64 = 32 * MIB;

/// Target block count; exceeded only once blocks hit [`MAX_BLOCK_SIZE`]
pub const MAX_BLOCK_COUNT: u64 = 1024;

/// Block size for a split upload of `length` bytes
///
/// The smallest multiple of 1 MiB that keeps the file within
/// [`MAX_BLOCK_COUNT`] blocks, clamped to
/// [`MIN_BLOCK_SIZE`]..=[`MAX_BLOCK_SIZE`].
///
/// ```
/// use pan_transfer::upload::block_size_for;
///
/// assert_eq!(block_size_for(100), 4 * 1024 * 1024);
/// assert_eq!(block_size_for(8 * 1024 * 1024 * 1024), 8 * 1024 * 1024);
/// assert_eq!(block_size_for(u64::MAX / 2), 32 * 1024 * 1024);
/// ```
pub fn block_size_for(length: u64) -> u64 {
    let per_block = length.div_ceil(MAX_BLOCK_COUNT);
    let rounded = per_block.div_ceil(MIB).saturating_mul(MIB);
    rounded.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
}

/// Totals of an upload session shared by all of its tasks
#[derive(Debug)]
pub struct UploadStatistic {
    total_size: AtomicU64,
    start: Instant,
}

impl UploadStatistic {
    /// Start counting now
    pub fn new() -> Self {
        Self {
            total_size: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// Record a finished file of `size` bytes
    pub fn add_total_size(&self, size: u64) {
        self.total_size.fetch_add(size, Ordering::Relaxed);
    }

    /// Bytes of all finished files
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    /// Time since the session started
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for UploadStatistic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_files_use_minimum_block() {
        assert_eq!(block_size_for(0), MIN_BLOCK_SIZE);
        assert_eq!(block_size_for(4 * 1024 * MIB), MIN_BLOCK_SIZE);
    }

    #[test]
    fn block_size_rounds_up_to_whole_mebibytes() {
        // 5 GiB + 1 byte needs just over 5 MiB per block
        assert_eq!(block_size_for(5 * 1024 * MIB + 1), 6 * MIB);
        assert_eq!(block_size_for(10 * 1024 * MIB), 10 * MIB);
    }

    #[test]
    fn block_count_grows_past_limit_once_capped() {
        let length = 64 * 1024 * MIB;
        let block = block_size_for(length);
        assert_eq!(block, MAX_BLOCK_SIZE);
        assert_eq!(length.div_ceil(block), 2048);
    }

    #[test]
    fn statistic_accumulates() {
        let stats = UploadStatistic::new();
        stats.add_total_size(10);
        stats.add_total_size(5);
        assert_eq!(stats.total_size(), 15);
    }
}
