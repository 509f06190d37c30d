//! Common test utilities for pan-transfer integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use pan_transfer::ConflictPolicy;
use pan_transfer::error::{PcsError, remote_code};
use pan_transfer::printer::Printer;
use pan_transfer::upload::{BlockBody, RapidUploadHashes, RemoteEntry, StorageClient};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory remote storage with content-addressed rapid upload
#[derive(Default)]
pub struct MemoryStorage {
    files: Mutex<HashMap<String, Vec<u8>>>,
    blocks: Mutex<HashMap<String, Vec<u8>>>,
    failing_block_calls: Mutex<HashMap<usize, PcsError>>,
    block_delay: Mutex<Duration>,
    block_calls: AtomicUsize,
    rapid_calls: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the `n`th block upload (0-based, counted over the storage lifetime) fail
    pub fn fail_block_call(&self, n: usize) {
        self.fail_block_call_with(n, PcsError::Network("connection reset by peer".into()));
    }

    pub fn fail_block_call_with(&self, n: usize, error: PcsError) {
        self.failing_block_calls.lock().unwrap().insert(n, error);
    }

    /// Hold every block upload for `delay` before answering
    pub fn set_block_delay(&self, delay: Duration) {
        *self.block_delay.lock().unwrap() = delay;
    }

    pub fn block_calls(&self) -> usize {
        self.block_calls.load(Ordering::SeqCst)
    }

    pub fn rapid_calls(&self) -> usize {
        self.rapid_calls.load(Ordering::SeqCst)
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn put(&self, path: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
    }
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5::compute(data).0)
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => ".",
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteEntry>, PcsError> {
        let files = self.files.lock().unwrap();
        let entries: Vec<RemoteEntry> = files
            .iter()
            .filter(|(path, _)| parent(path) == dir)
            .map(|(path, content)| RemoteEntry {
                filename: path.rsplit('/').next().unwrap_or_default().to_string(),
                path: path.clone(),
                md5: md5_hex(content),
                size: content.len() as u64,
                is_dir: false,
            })
            .collect();
        if entries.is_empty() {
            return Err(PcsError::remote(remote_code::FILE_NOT_FOUND, "no such directory"));
        }
        Ok(entries)
    }

    async fn rapid_upload(&self, target: &str, hashes: &RapidUploadHashes) -> Result<(), PcsError> {
        self.rapid_calls.fetch_add(1, Ordering::SeqCst);
        let mut files = self.files.lock().unwrap();
        let known = files
            .values()
            .find(|content| content.len() as u64 == hashes.length && md5_hex(content) == hashes.md5)
            .cloned();
        match known {
            Some(content) => {
                files.insert(target.to_string(), content);
                Ok(())
            }
            None => Err(PcsError::remote(31079, "file md5 not found, use upload api")),
        }
    }

    async fn upload_block(&self, _target: &str, body: BlockBody) -> Result<String, PcsError> {
        let call = self.block_calls.fetch_add(1, Ordering::SeqCst);
        let data = body
            .read_to_end()
            .await
            .map_err(|e| PcsError::Network(e.to_string()))?;
        let delay = *self.block_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failing_block_calls.lock().unwrap().remove(&call) {
            return Err(error);
        }
        let checksum = md5_hex(&data);
        self.blocks.lock().unwrap().insert(checksum.clone(), data);
        Ok(checksum)
    }

    async fn create_superfile(
        &self,
        target: &str,
        block_checksums: &[String],
        policy: ConflictPolicy,
    ) -> Result<(), PcsError> {
        let blocks = self.blocks.lock().unwrap();
        let mut content = Vec::new();
        for checksum in block_checksums {
            let block = blocks.get(checksum).ok_or_else(|| {
                PcsError::remote(remote_code::BLOCK_MISS_IN_SUPERFILE, "block miss in superfile2")
            })?;
            content.extend_from_slice(block);
        }
        let mut files = self.files.lock().unwrap();
        if policy == ConflictPolicy::Fail && files.contains_key(target) {
            return Err(PcsError::remote(remote_code::FILE_ALREADY_EXISTS, "file already exists"));
        }
        files.insert(target.to_string(), content);
        Ok(())
    }
}

/// Printer keeping every message
#[derive(Default)]
pub struct Lines(Mutex<Vec<String>>);

impl Lines {
    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Printer for Lines {
    fn print(&self, message: &str) {
        self.0.lock().unwrap().push(message.to_string());
    }
}

/// Writer collecting everything the renderer draws
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Capture {
    pub fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }

    /// Text drawn after the last cursor movement
    pub fn last_frame(&self) -> String {
        let text = self.text();
        match text.rfind("\x1b[") {
            Some(i) => {
                let rest = &text[i..];
                let end = rest.find('A').map(|a| a + 1).unwrap_or(0);
                rest[end..].to_string()
            }
            None => text,
        }
    }
}

/// Deterministic file content of `len` bytes
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}
