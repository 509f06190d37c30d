//! Storage protocol seam
//!
//! The protocol client itself lives outside this crate. Everything the
//! upload path needs from it is the [`StorageClient`] trait.

use crate::config::ConflictPolicy;
use crate::error::PcsError;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use std::fmt;

/// Entry of a remote directory listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Leaf name
    pub filename: String,
    /// Full remote path
    pub path: String,
    /// Content MD5 as reported by the server, lower-case hex
    pub md5: String,
    /// Size in bytes
    pub size: u64,
    /// Whether the entry is a directory
    pub is_dir: bool,
}

/// Hashes presented to the rapid-upload operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RapidUploadHashes {
    /// Full-file MD5, hex
    pub md5: String,
    /// MD5 of the leading slice, hex
    pub slice_md5: String,
    /// CRC32 in decimal, empty when not computed
    pub crc32: String,
    /// File length
    pub length: u64,
}

/// Body of one block upload
///
/// The bytes arrive as a stream of chunks read from the local file on
/// demand, so memory stays bounded by the chunk size whatever the block size.
/// A chunk error means the local read failed; the client should abort the
/// request.
pub struct BlockBody {
    len: u64,
    chunks: BoxStream<'static, std::io::Result<Vec<u8>>>,
}

impl BlockBody {
    /// Body of `len` bytes produced by `chunks`
    pub fn new(len: u64, chunks: BoxStream<'static, std::io::Result<Vec<u8>>>) -> Self {
        Self { len, chunks }
    }

    /// Body held in memory as a single chunk
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self::new(len, futures::stream::iter([Ok(data)]).boxed())
    }

    /// Total length, for a `Content-Length` header
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the block is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The chunk stream
    pub fn into_stream(self) -> BoxStream<'static, std::io::Result<Vec<u8>>> {
        self.chunks
    }

    /// Buffer the whole body
    pub async fn read_to_end(self) -> std::io::Result<Vec<u8>> {
        let capacity = usize::try_from(self.len).unwrap_or(0);
        self.chunks
            .try_fold(Vec::with_capacity(capacity), |mut data, chunk| async move {
                data.extend_from_slice(&chunk);
                Ok(data)
            })
            .await
    }
}

impl fmt::Debug for BlockBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBody").field("len", &self.len).finish_non_exhaustive()
    }
}

/// Client of the remote storage protocol
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// List the entries of directory `dir`
    ///
    /// A directory that does not exist is reported as a remote error with
    /// code [`crate::error::remote_code::FILE_NOT_FOUND`].
    async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteEntry>, PcsError>;

    /// Create `target` from content the server already holds
    async fn rapid_upload(&self, target: &str, hashes: &RapidUploadHashes)
    -> Result<(), PcsError>;

    /// Upload one block for `target`, returning its remote checksum
    async fn upload_block(&self, target: &str, body: BlockBody) -> Result<String, PcsError>;

    /// Assemble `target` from uploaded blocks, in order
    async fn create_superfile(
        &self,
        target: &str,
        block_checksums: &[String],
        policy: ConflictPolicy,
    ) -> Result<(), PcsError>;
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_are_concatenated_in_order() {
        let chunks = futures::stream::iter([Ok(b"ab".to_vec()), Ok(b"cde".to_vec())]).boxed();
        let body = BlockBody::new(5, chunks);
        assert_eq!(body.len(), 5);
        assert_eq!(body.read_to_end().await.unwrap(), b"abcde");
    }

    #[tokio::test]
    async fn chunk_error_fails_the_read() {
        let chunks = futures::stream::iter([
            Ok(b"ab".to_vec()),
            Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)),
        ])
        .boxed();
        let err = BlockBody::new(4, chunks).read_to_end().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn in_memory_body_reports_its_length() {
        assert_eq!(BlockBody::from_bytes(vec![1, 2, 3]).len(), 3);
        assert!(BlockBody::from_bytes(Vec::new()).is_empty());
    }
}
