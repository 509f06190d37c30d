//! Multipart transfer of one file
//!
//! The file is split into blocks that are uploaded with bounded parallelism
//! and then assembled remotely into a superfile. Progress is kept in a
//! [`ResumeState`] that can be seeded from a checkpoint and read back at any
//! time, so an interrupted transfer only resends unfinished blocks.

use super::checkpoint::ResumeState;
use super::remote::{BlockBody, StorageClient};
use crate::config::ConflictPolicy;
use crate::error::{Error, Result};
use crate::rate_limit::RateLimiter;
use futures::{StreamExt, TryStreamExt};
use std::fs::File;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Largest chunk read from the file at once
pub const READ_CHUNK_SIZE: u64 = 1024 * 1024;

/// Parameters of one multipart transfer
#[derive(Clone, Debug)]
pub struct MultipartConfig {
    /// Blocks in flight at once
    pub parallel: usize,
    /// Size of each block; the last one may be shorter
    pub block_size: u64,
    /// What the server does when the target name is taken
    pub policy: ConflictPolicy,
    /// Period of status callbacks
    pub status_interval: Duration,
    /// Minimum time between two "update available" signals
    pub checkpoint_interval: Duration,
}

/// Snapshot passed to the status callback
#[derive(Debug)]
pub struct TransferStatus<'a> {
    /// Bytes transferred, including blocks completed in earlier attempts
    pub uploaded: u64,
    /// File length
    pub total_size: u64,
    /// Average speed of this attempt in bytes per second
    pub speed_per_second: u64,
    /// Time since this attempt started
    pub elapsed: Duration,
    /// Whether the resume state changed enough to be worth persisting
    pub update_available: bool,
    /// Current resume state
    pub state: &'a ResumeState,
}

/// Uploader of one file in blocks
pub struct MultiUploader {
    client: Arc<dyn StorageClient>,
    target: String,
    file: Arc<File>,
    length: u64,
    config: MultipartConfig,
    limiter: RateLimiter,
    state: ResumeState,
}

impl MultiUploader {
    /// Uploader sending `length` bytes of `file` to `target`
    pub fn new(
        client: Arc<dyn StorageClient>,
        target: impl Into<String>,
        file: Arc<File>,
        length: u64,
        config: MultipartConfig,
        limiter: RateLimiter,
    ) -> Self {
        let state = ResumeState::new(length, config.block_size);
        Self {
            client,
            target: target.into(),
            file,
            length,
            config,
            limiter,
            state,
        }
    }

    /// Continue from a previous attempt
    ///
    /// The state is adopted only if its blocks tile the file exactly;
    /// otherwise the fresh layout is kept and `false` is returned.
    pub fn set_resume_state(&mut self, state: ResumeState) -> bool {
        if !state.covers(self.length) {
            return false;
        }
        self.state = state;
        true
    }

    /// Current progress
    pub fn resume_state(&self) -> &ResumeState {
        &self.state
    }

    /// Upload all unfinished blocks, then assemble the remote file
    ///
    /// `on_status` is called every `status_interval` while blocks are in
    /// flight and once more after the last block completes.
    pub async fn execute<F>(&mut self, mut on_status: F) -> Result<()>
    where
        F: FnMut(&TransferStatus<'_>) + Send,
    {
        let pending: Vec<(usize, u64, u64)> = self
            .state
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, block)| !block.is_complete())
            .map(|(index, block)| (index, block.offset, block.len))
            .collect();
        tracing::debug!(
            target_path = %self.target,
            blocks = self.state.blocks.len(),
            pending = pending.len(),
            block_size = self.state.block_size,
            "Starting multipart upload"
        );

        let client = self.client.clone();
        let file = self.file.clone();
        let limiter = self.limiter.clone();
        let target = self.target.clone();
        let blocks = futures::stream::iter(pending)
            .map(move |(index, offset, len)| {
                let client = client.clone();
                let file = file.clone();
                let limiter = limiter.clone();
                let target = target.clone();
                async move {
                    let read_error = Arc::new(Mutex::new(None));
                    let body = block_body(file, offset, len, limiter, read_error.clone());
                    match client.upload_block(&target, body).await {
                        Ok(checksum) => Ok::<_, Error>((index, len, checksum)),
                        Err(e) => {
                            // A failed local read outranks whatever the client made of it.
                            let local = read_error.lock().unwrap_or_else(|p| p.into_inner()).take();
                            Err(local.map(Error::from).unwrap_or_else(|| e.into()))
                        }
                    }
                }
            })
            .buffer_unordered(self.config.parallel.max(1));
        let mut blocks = std::pin::pin!(blocks);

        // A zero period would make the ticker panic.
        let period = self.config.status_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut progress = Progress::new(self.state.completed_bytes());
        loop {
            tokio::select! {
                next = blocks.next() => match next {
                    Some(Ok((index, len, checksum))) => {
                        self.state.blocks[index].checksum = Some(checksum);
                        progress.block_done(len);
                    }
                    Some(Err(e)) => {
                        tracing::debug!(target_path = %self.target, error = %e, "Block upload failed");
                        return Err(e);
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    on_status(&progress.status(self.length, &self.state, self.config.checkpoint_interval));
                }
            }
        }
        on_status(&progress.status(self.length, &self.state, self.config.checkpoint_interval));

        let checksums = self.state.block_checksums().ok_or_else(|| {
            Error::Other("multipart upload finished with incomplete blocks".into())
        })?;
        self.client
            .create_superfile(&self.target, &checksums, self.config.policy)
            .await?;
        tracing::debug!(target_path = %self.target, blocks = checksums.len(), "Created superfile");
        Ok(())
    }
}

struct Progress {
    start: Instant,
    resumed: u64,
    sent: u64,
    last_signal: Instant,
    dirty: bool,
}

impl Progress {
    fn new(resumed: u64) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            resumed,
            sent: 0,
            last_signal: now,
            dirty: false,
        }
    }

    fn block_done(&mut self, len: u64) {
        self.sent += len;
        self.dirty = true;
    }

    fn status<'a>(
        &mut self,
        total_size: u64,
        state: &'a ResumeState,
        window: Duration,
    ) -> TransferStatus<'a> {
        let elapsed = self.start.elapsed();
        let update_available = self.dirty && self.last_signal.elapsed() >= window;
        if update_available {
            self.dirty = false;
            self.last_signal = Instant::now();
        }
        let secs = elapsed.as_secs_f64();
        let speed_per_second = if secs > 0.0 {
            (self.sent as f64 / secs) as u64
        } else {
            0
        };
        TransferStatus {
            uploaded: self.resumed + self.sent,
            total_size,
            speed_per_second,
            elapsed,
            update_available,
            state,
        }
    }
}

/// Lazily read `len` bytes at `offset` in chunks of at most [`READ_CHUNK_SIZE`]
///
/// Each chunk is paid for at the rate limiter before it is handed out. The
/// first read error is also stored in `read_error`.
fn block_body(
    file: Arc<File>,
    offset: u64,
    len: u64,
    limiter: RateLimiter,
    read_error: Arc<Mutex<Option<std::io::Error>>>,
) -> BlockBody {
    let end = offset + len;
    let chunks = futures::stream::try_unfold(
        (file, offset, limiter),
        move |(file, pos, limiter)| async move {
            if pos >= end {
                return Ok::<_, std::io::Error>(None);
            }
            let n = (end - pos).min(READ_CHUNK_SIZE);
            let reader = file.clone();
            let chunk = tokio::task::spawn_blocking(move || read_at(&reader, pos, n))
                .await
                .map_err(std::io::Error::other)??;
            limiter.acquire(n).await;
            Ok(Some((chunk, (file, pos + n, limiter))))
        },
    )
    .inspect_err(move |e| {
        let mut slot = read_error.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(std::io::Error::new(e.kind(), e.to_string()));
        }
    })
    .boxed();
    BlockBody::new(len, chunks)
}

/// Read exactly `len` bytes at `offset` without moving a shared cursor
pub(crate) fn read_at(file: &File, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let len = usize::try_from(len)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "block too large"))?;
    let mut buf = vec![0u8; len];

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(&mut buf, offset)?;
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut filled = 0;
        while filled < len {
            let n = file.seek_read(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            filled += n;
        }
    }

    Ok(buf)
}
