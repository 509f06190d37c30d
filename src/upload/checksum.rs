//! Local file identity and lazily computed content hashes

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Bytes covered by the slice MD5
pub const SLICE_MD5_SIZE: u64 = 256 * 1024;

/// Identity of a local file as the remote side and the checkpoint store see it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileMeta {
    /// Local path
    pub path: PathBuf,
    /// Size in bytes
    pub length: u64,
    /// Last modification time, seconds since the Unix epoch
    pub mod_time: i64,
    /// MD5 of the whole file
    #[serde(default, with = "hex_digest")]
    pub md5: Option<[u8; 16]>,
    /// MD5 of the first [`SLICE_MD5_SIZE`] bytes
    #[serde(default, with = "hex_digest")]
    pub slice_md5: Option<[u8; 16]>,
    /// CRC32 of the whole file
    #[serde(default)]
    pub crc32: Option<u32>,
}

impl LocalFileMeta {
    /// Whether `other` describes the same file version
    pub fn same_file(&self, other: &LocalFileMeta) -> bool {
        self.path == other.path && self.length == other.length && self.mod_time == other.mod_time
    }

    /// Take hashes from `other` that are not cached here yet
    pub fn merge_cached_hashes(&mut self, other: &LocalFileMeta) {
        if self.md5.is_none() {
            self.md5 = other.md5;
        }
        if self.slice_md5.is_none() {
            self.slice_md5 = other.slice_md5;
        }
        if self.crc32.is_none() {
            self.crc32 = other.crc32;
        }
    }

    /// Lower-case hex of the full MD5
    pub fn md5_hex(&self) -> Option<String> {
        self.md5.map(hex::encode)
    }

    /// Lower-case hex of the slice MD5
    pub fn slice_md5_hex(&self) -> Option<String> {
        self.slice_md5.map(hex::encode)
    }
}

/// Set of hashes to compute
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Checksums {
    md5: bool,
    slice_md5: bool,
    crc32: bool,
}

impl Checksums {
    /// Full-file MD5
    pub const MD5: Checksums = Checksums {
        md5: true,
        slice_md5: false,
        crc32: false,
    };
    /// MD5 of the leading slice
    pub const SLICE_MD5: Checksums = Checksums {
        md5: false,
        slice_md5: true,
        crc32: false,
    };
    /// Full-file CRC32
    pub const CRC32: Checksums = Checksums {
        md5: false,
        slice_md5: false,
        crc32: true,
    };
    /// Every supported hash
    pub const ALL: Checksums = Checksums {
        md5: true,
        slice_md5: true,
        crc32: true,
    };
}

impl BitOr for Checksums {
    type Output = Checksums;

    fn bitor(self, rhs: Checksums) -> Checksums {
        Checksums {
            md5: self.md5 || rhs.md5,
            slice_md5: self.slice_md5 || rhs.slice_md5,
            crc32: self.crc32 || rhs.crc32,
        }
    }
}

/// A local file being uploaded, with its open handle and identity
///
/// Hashes are computed on demand by [`LocalFile::sum`] and cached for the
/// lifetime of the value; a cached hash is never recomputed.
#[derive(Debug)]
pub struct LocalFile {
    meta: LocalFileMeta,
    handle: Option<Arc<File>>,
}

impl LocalFile {
    /// File at `path`; nothing is read until [`LocalFile::open`]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            meta: LocalFileMeta {
                path: path.into(),
                ..LocalFileMeta::default()
            },
            handle: None,
        }
    }

    /// Identity of the file
    pub fn meta(&self) -> &LocalFileMeta {
        &self.meta
    }

    /// Mutable identity, for merging cached hashes
    pub fn meta_mut(&mut self) -> &mut LocalFileMeta {
        &mut self.meta
    }

    /// Local path
    pub fn path(&self) -> &Path {
        &self.meta.path
    }

    /// Size in bytes, valid after [`LocalFile::open`]
    pub fn length(&self) -> u64 {
        self.meta.length
    }

    /// Open the file and refresh length and modification time
    ///
    /// If the file changed since hashes were cached, the cache is dropped.
    pub async fn open(&mut self) -> Result<()> {
        let path = self.meta.path.clone();
        let (file, length, mod_time) = tokio::task::spawn_blocking(move || {
            let file = File::open(&path)?;
            let metadata = file.metadata()?;
            if metadata.is_dir() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} is a directory", path.display()),
                ));
            }
            let mod_time = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default();
            Ok((file, metadata.len(), mod_time))
        })
        .await
        .map_err(|e| Error::Other(format!("open task failed: {e}")))??;

        if self.meta.length != length || self.meta.mod_time != mod_time {
            self.meta.md5 = None;
            self.meta.slice_md5 = None;
            self.meta.crc32 = None;
        }
        self.meta.length = length;
        self.meta.mod_time = mod_time;
        self.handle = Some(Arc::new(file));
        Ok(())
    }

    /// Shared handle of the open file
    pub fn handle(&self) -> Option<Arc<File>> {
        self.handle.clone()
    }

    /// Release the file handle, keeping identity and cached hashes
    pub fn close(&mut self) {
        self.handle = None;
    }

    /// Compute the requested hashes that are not cached yet
    ///
    /// All missing hashes are computed in a single pass over the file on a
    /// blocking thread.
    pub async fn sum(&mut self, wanted: Checksums) -> Result<()> {
        let missing = Checksums {
            md5: wanted.md5 && self.meta.md5.is_none(),
            slice_md5: wanted.slice_md5 && self.meta.slice_md5.is_none(),
            crc32: wanted.crc32 && self.meta.crc32.is_none(),
        };
        if missing == Checksums::default() {
            return Ok(());
        }

        let file = self.handle.clone().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "file is not open",
            ))
        })?;
        let length = self.meta.length;

        let digests = tokio::task::spawn_blocking(move || hash_file(&file, length, missing))
            .await
            .map_err(|e| Error::Other(format!("checksum task failed: {e}")))??;

        if missing.md5 {
            self.meta.md5 = digests.md5;
        }
        if missing.slice_md5 {
            self.meta.slice_md5 = digests.slice_md5;
        }
        if missing.crc32 {
            self.meta.crc32 = digests.crc32;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Digests {
    md5: Option<[u8; 16]>,
    slice_md5: Option<[u8; 16]>,
    crc32: Option<u32>,
}

fn hash_file(file: &File, length: u64, wanted: Checksums) -> std::io::Result<Digests> {
    let mut md5 = wanted.md5.then(md5::Context::new);
    let mut slice = wanted.slice_md5.then(md5::Context::new);
    let mut crc = wanted.crc32.then(crc32fast::Hasher::new);

    // Only the leading slice is needed when nothing else was asked for.
    let end = if wanted.md5 || wanted.crc32 {
        length
    } else {
        length.min(SLICE_MD5_SIZE)
    };

    let mut offset = 0u64;
    while offset < end {
        let len = (end - offset).min(super::multipart::READ_CHUNK_SIZE);
        let chunk = super::multipart::read_at(file, offset, len)?;
        if let Some(ctx) = md5.as_mut() {
            ctx.consume(&chunk);
        }
        if let Some(hasher) = crc.as_mut() {
            hasher.update(&chunk);
        }
        if let Some(ctx) = slice.as_mut() {
            if offset < SLICE_MD5_SIZE {
                let take = (SLICE_MD5_SIZE - offset).min(len) as usize;
                ctx.consume(&chunk[..take]);
            }
        }
        offset += len;
    }

    Ok(Digests {
        md5: md5.map(|ctx| ctx.compute().0),
        slice_md5: slice.map(|ctx| ctx.compute().0),
        crc32: crc.map(|hasher| hasher.finalize()),
    })
}

// Optional 16-byte digest as lower-case hex
mod hex_digest {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(digest: &Option<[u8; 16]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match digest {
            Some(d) => serializer.serialize_some(&hex::encode(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 16]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(text) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let mut digest = [0u8; 16];
        hex::decode_to_slice(&text, &mut digest).map_err(serde::de::Error::custom)?;
        Ok(Some(digest))
    }
}
