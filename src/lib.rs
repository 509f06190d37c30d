//! # pan-transfer
//!
//! Resilient transfer core of a cloud-storage client.
//!
//! ## Design Philosophy
//!
//! pan-transfer is designed to be:
//! - **Retry-driven** - Every unit of work is a [`task::Task`] driven by one
//!   generic [`retry::execute`] loop; tasks decide *whether* to retry, the
//!   executor decides *when*
//! - **Resumable** - Multipart uploads checkpoint their progress and resend
//!   only unfinished blocks
//! - **Deduplicating** - Content the server already holds is never resent
//! - **Library-first** - The storage protocol client and checkpoint store are
//!   traits; the crate never talks HTTP itself
//!
//! ## Quick Start
//!
//! ```no_run
//! use pan_transfer::printer::Renderer;
//! use pan_transfer::task::TaskGroup;
//! use pan_transfer::upload::{JsonCheckpointStore, StorageClient, UploadContext, UploadTask};
//! use pan_transfer::Config;
//! use std::sync::Arc;
//!
//! async fn upload_all(client: Arc<dyn StorageClient>) -> pan_transfer::Result<()> {
//!     let config = Config::default();
//!     let checkpoints = Arc::new(JsonCheckpointStore::open("uploading.json").await?);
//!     let ctx = UploadContext::new(client, checkpoints, &config);
//!
//!     let renderer = Renderer::start(std::io::stdout(), &config.renderer);
//!     let mut group = TaskGroup::new(config.upload.parallel).with_printer(renderer.printer());
//!     for (local, remote) in [("a.bin", "/backup/a.bin"), ("b.bin", "/backup/b.bin")] {
//!         group.append(UploadTask::new(ctx.clone(), local, remote), config.upload.max_retry);
//!     }
//!
//!     let reports = group.execute().await;
//!     renderer.stop().await?;
//!
//!     let failed = reports.iter().filter(|r| !r.succeeded).count();
//!     println!("{} uploaded, {failed} failed", reports.len() - failed);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Concurrent terminal renderer
pub mod printer;
/// Upload rate limiting with a token bucket
pub mod rate_limit;
/// Retry executor with exponential backoff
pub mod retry;
/// Task contract and concurrent task groups
pub mod task;
/// Rapid and resumable multipart upload
pub mod upload;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, ConflictPolicy, RendererConfig, RetryConfig, UploadConfig};
pub use error::{Error, PcsError, Result};
pub use printer::{Printer, Renderer, TaskPrinter, TaskStatus};
pub use retry::{ExecutionReport, execute};
pub use task::{RunResult, Task, TaskGroup, TaskInfo};
pub use upload::{UploadContext, UploadStatistic, UploadTask};
