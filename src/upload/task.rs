use super::checkpoint::{CheckpointStore, ResumeState};
use super::checksum::{Checksums, LocalFile};
use super::multipart::{MultiUploader, MultipartConfig, TransferStatus};
use super::policy::{FailurePolicy, classify};
use super::remote::{RapidUploadHashes, StorageClient};
use super::{LARGE_FILE_HINT_SIZE, MAX_RAPID_UPLOAD_SIZE, UploadStatistic, block_size_for};
use crate::config::{Config, RetryConfig, UploadConfig};
use crate::error::{Error, PcsError, remote_code};
use crate::printer::{LogPrinter, SharedPrinter};
use crate::rate_limit::RateLimiter;
use crate::retry::backoff_delay;
use crate::task::{RunResult, Task, TaskInfo};
use crate::utils::{format_elapsed, format_size};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const UPLOAD_FAILED: &str = "upload failed";

/// Stage an upload task is in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadStep {
    /// Opening the file and looking for a checkpoint
    Init,
    /// Trying to create the target from hashes
    RapidUpload,
    /// Multipart transfer
    Upload,
}

/// Collaborators shared by every upload task of a session
#[derive(Clone)]
pub struct UploadContext {
    /// Storage protocol client
    pub client: Arc<dyn StorageClient>,
    /// Resume checkpoints
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Upload settings
    pub upload: UploadConfig,
    /// Backoff between attempts
    pub retry: RetryConfig,
    /// Bandwidth ceiling shared by all transfers
    pub limiter: RateLimiter,
    /// Session totals
    pub statistic: Arc<UploadStatistic>,
}

impl UploadContext {
    /// Context built from `config`, with a fresh limiter and statistic
    pub fn new(
        client: Arc<dyn StorageClient>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: &Config,
    ) -> Self {
        Self {
            client,
            checkpoints,
            upload: config.upload.clone(),
            retry: config.retry.clone(),
            limiter: RateLimiter::new(config.upload.max_upload_rate),
            statistic: Arc::new(UploadStatistic::new()),
        }
    }
}

enum Stage {
    Done(RunResult),
    Continue,
}

/// Upload of one local file to one remote path
pub struct UploadTask {
    ctx: UploadContext,
    file: LocalFile,
    save_path: String,
    remote_dir: String,
    remote_name: String,
    step: UploadStep,
    state: Option<ResumeState>,
    info: Option<TaskInfo>,
    printer: SharedPrinter,
    persisting: Arc<AtomicBool>,
}

impl UploadTask {
    /// Task uploading `local_path` to `save_path`
    pub fn new(ctx: UploadContext, local_path: impl Into<PathBuf>, save_path: impl Into<String>) -> Self {
        let save_path = save_path.into();
        let printer: SharedPrinter = Arc::new(LogPrinter::new(save_path.clone()));
        Self {
            ctx,
            file: LocalFile::new(local_path),
            save_path,
            remote_dir: String::new(),
            remote_name: String::new(),
            step: UploadStep::Init,
            state: None,
            info: None,
            printer,
            persisting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stage reached by the last attempt
    pub fn step(&self) -> UploadStep {
        self.step
    }

    /// Remote destination
    pub fn save_path(&self) -> &str {
        &self.save_path
    }

    /// The local file and its cached hashes
    pub fn local_file(&self) -> &LocalFile {
        &self.file
    }

    fn print(&self, message: &str) {
        self.printer.print(message);
    }

    fn prepare(&mut self) {
        self.step = UploadStep::Init;
        let (dir, name) = split_remote_path(&self.save_path);
        self.remote_dir = dir;
        self.remote_name = name;

        self.state = self
            .ctx
            .checkpoints
            .find(self.file.meta_mut())
            .and_then(|entry| entry.state);

        self.step = if self.state.is_some() || self.file.meta().md5.is_some() {
            UploadStep::Upload
        } else if self.ctx.upload.no_rapid_upload {
            UploadStep::Upload
        } else if self.file.length() > MAX_RAPID_UPLOAD_SIZE {
            self.print("file exceeds 20GB, rapid upload is not available, skipping rapid upload...");
            UploadStep::Upload
        } else {
            UploadStep::RapidUpload
        };
        tracing::debug!(
            save_path = %self.save_path,
            step = ?self.step,
            resumed = self.state.is_some(),
            "Prepared upload"
        );
    }

    async fn rapid_upload(&mut self) -> Stage {
        self.step = UploadStep::RapidUpload;

        let listing = match self.ctx.client.list_dir(&self.remote_dir).await {
            Ok(entries) => entries,
            Err(PcsError::Remote {
                code: remote_code::FILE_NOT_FOUND,
                ..
            }) => Vec::new(),
            Err(e @ PcsError::Remote { .. }) => {
                return Stage::Done(RunResult::failed(
                    "failed to list remote directory",
                    Some(e.into()),
                ));
            }
            Err(e) => {
                return Stage::Done(RunResult::retry(
                    "failed to list remote directory",
                    Some(e.into()),
                ));
            }
        };

        if self.file.length() >= LARGE_FILE_HINT_SIZE {
            self.print("checking rapid upload, please wait...");
        }

        if let Err(e) = self.file.sum(Checksums::ALL).await {
            return Stage::Done(RunResult::failed(
                "failed to compute rapid upload hashes",
                Some(e),
            ));
        }
        let meta = self.file.meta().clone();

        let already_there = listing
            .iter()
            .filter(|entry| !entry.is_dir && entry.filename == self.remote_name)
            .any(|entry| {
                let mut remote = [0u8; 16];
                match hex::decode_to_slice(&entry.md5, &mut remote) {
                    Ok(()) => meta.md5 == Some(remote),
                    Err(e) => {
                        tracing::debug!(
                            path = %entry.path,
                            md5 = %entry.md5,
                            error = %e,
                            "Malformed remote MD5, treating as different content"
                        );
                        false
                    }
                }
            });
        if already_there {
            self.print(&format!("target file {} already exists, skipping...", self.save_path));
            self.ctx.statistic.add_total_size(meta.length);
            return Stage::Done(RunResult::success());
        }

        let (Some(md5), Some(slice_md5)) = (meta.md5_hex(), meta.slice_md5_hex()) else {
            return Stage::Done(RunResult::failed(
                "failed to compute rapid upload hashes",
                None,
            ));
        };
        let hashes = RapidUploadHashes {
            md5,
            slice_md5,
            crc32: meta.crc32.map(|c| c.to_string()).unwrap_or_default(),
            length: meta.length,
        };

        match self.ctx.client.rapid_upload(&self.save_path, &hashes).await {
            Ok(()) => {
                self.print(&format!("rapid upload succeeded, saved to: {}", self.save_path));
                self.ctx.statistic.add_total_size(meta.length);
                Stage::Done(RunResult::success())
            }
            Err(PcsError::Remote {
                code: remote_code::EXCEED_QUOTA,
                ..
            }) => Stage::Done(RunResult::failed(
                "rapid upload failed, quota exceeded, storage is full",
                None,
            )),
            Err(e) => {
                tracing::debug!(save_path = %self.save_path, error = %e, "Rapid upload rejected");
                self.print("rapid upload failed, uploading file...");
                // Remember the attempt, with its hashes, in case nothing else gets persisted.
                self.ctx.checkpoints.upsert(&meta, None);
                if let Err(e) = self.ctx.checkpoints.persist().await {
                    tracing::warn!(error = %e, "Failed to persist checkpoint");
                }
                Stage::Continue
            }
        }
    }

    async fn upload(&mut self) -> RunResult {
        self.step = UploadStep::Upload;

        let Some(handle) = self.file.handle() else {
            return RunResult::failed(
                UPLOAD_FAILED,
                Some(Error::Other("file is not open".into())),
            );
        };
        let length = self.file.length();
        let block_size = if self.ctx.upload.no_split_file {
            length.max(1)
        } else {
            block_size_for(length)
        };

        let mut uploader = MultiUploader::new(
            self.ctx.client.clone(),
            self.save_path.clone(),
            handle,
            length,
            MultipartConfig {
                parallel: self.ctx.upload.parallel,
                block_size,
                policy: self.ctx.upload.conflict_policy,
                status_interval: self.ctx.upload.status_interval,
                checkpoint_interval: self.ctx.upload.checkpoint_interval,
            },
            self.ctx.limiter.clone(),
        );
        if let Some(state) = self.state.take() {
            if !uploader.set_resume_state(state) {
                tracing::debug!(save_path = %self.save_path, "Checkpoint does not match file, starting over");
            }
        }

        let meta = self.file.meta().clone();
        let checkpoints = self.ctx.checkpoints.clone();
        let printer = self.printer.clone();
        let persisting = self.persisting.clone();
        let outcome = uploader
            .execute(move |status: &TransferStatus<'_>| {
                if status.update_available {
                    checkpoints.upsert(&meta, Some(status.state.clone()));
                    persist_in_background(&checkpoints, &persisting);
                }
                printer.print(&format!(
                    "↑ {}/{} {}/s in {} ............",
                    format_size(status.uploaded),
                    format_size(status.total_size),
                    format_size(status.speed_per_second),
                    format_elapsed(status.elapsed),
                ));
            })
            .await;

        let meta = self.file.meta().clone();
        let checkpoints = self.ctx.checkpoints.clone();
        match outcome {
            Ok(()) => {
                self.print(&format!("upload succeeded, saved to: {}", self.save_path));
                self.ctx.statistic.add_total_size(length);
                checkpoints.delete(&meta);
                persist_logged(checkpoints.as_ref()).await;
                RunResult::success()
            }
            Err(e) => match classify(&e) {
                FailurePolicy::ResetAndRetry => {
                    checkpoints.delete(&meta);
                    persist_logged(checkpoints.as_ref()).await;
                    RunResult::retry(
                        UPLOAD_FAILED,
                        Some(Error::Other("upload session expired, uploading again".into())),
                    )
                }
                FailurePolicy::Retry => {
                    checkpoints.upsert(&meta, Some(uploader.resume_state().clone()));
                    persist_logged(checkpoints.as_ref()).await;
                    RunResult::retry(UPLOAD_FAILED, Some(e))
                }
                FailurePolicy::Terminal => RunResult::failed(UPLOAD_FAILED, Some(e)),
            },
        }
    }
}

#[async_trait]
impl Task for UploadTask {
    fn bind(&mut self, info: TaskInfo) {
        self.info = Some(info);
    }

    fn set_printer(&mut self, printer: SharedPrinter) {
        self.printer = printer;
    }

    async fn run(&mut self) -> RunResult {
        self.print(&format!("preparing upload: {}", self.file.path().display()));

        if let Err(e) = self.file.open().await {
            return RunResult::failed("file is unreadable, skipping", Some(e));
        }

        self.prepare();
        let result = match self.step {
            UploadStep::RapidUpload => match self.rapid_upload().await {
                Stage::Done(result) => result,
                Stage::Continue => self.upload().await,
            },
            _ => self.upload().await,
        };

        self.file.close();
        result
    }

    fn on_retry(&mut self, last: &RunResult) {
        // The executor increments the counter after this call.
        let (retry, max_retry) = self
            .info
            .as_ref()
            .map(|info| (info.retry() + 1, info.max_retry()))
            .unwrap_or_default();
        self.print(&format!("{}, retry {retry}/{max_retry}", last.describe()));
    }

    fn on_failed(&mut self, last: &RunResult) {
        self.print(&last.describe());
    }

    fn retry_wait(&self) -> Duration {
        let retry = self.info.as_ref().map(TaskInfo::retry).unwrap_or_default();
        backoff_delay(&self.ctx.retry, retry)
    }
}

/// Start a checkpoint write unless one is already running
fn persist_in_background(checkpoints: &Arc<dyn CheckpointStore>, persisting: &Arc<AtomicBool>) {
    if persisting.swap(true, Ordering::AcqRel) {
        return;
    }
    let checkpoints = checkpoints.clone();
    let persisting = persisting.clone();
    tokio::spawn(async move {
        if let Err(e) = checkpoints.persist().await {
            tracing::warn!(error = %e, "Failed to persist checkpoint");
        }
        persisting.store(false, Ordering::Release);
    });
}

async fn persist_logged(checkpoints: &dyn CheckpointStore) {
    if let Err(e) = checkpoints.persist().await {
        tracing::warn!(error = %e, "Failed to persist checkpoint");
    }
}

/// Split a remote path into its parent directory and leaf name
fn split_remote_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(i) => (trimmed[..i].to_string(), trimmed[i + 1..].to_string()),
        None => (".".to_string(), trimmed.to_string()),
    }
}
