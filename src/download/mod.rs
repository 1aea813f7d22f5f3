//! Resumable HTTP transfers and the workers that run them.
//!
//! # Features
//!
//! - Ranged GET requests (`Range: bytes=<offset>-`) with manual redirects
//! - HTTP 416 treated as "already complete"
//! - Chunked streaming with throttled progress events
//! - Cooperative cancellation checked on every chunk
//! - One live worker per download identity
//!
//! # Example
//!
//! ```no_run
//! use download_manager::download::TransferClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = TransferClient::new()?;
//! let source = client.open("https://example.com/paper.pdf", 0).await?;
//! println!("total: {} bytes", source.total_size);
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
mod scheduler;
mod worker;

pub use client::{SourceReader, TransferClient, TransferOptions, TransferSource};
pub use error::{DownloadError, ErrorKind};
pub use scheduler::{TaskScheduler, WorkerState};
pub use worker::StreamOptions;

pub(crate) use worker::{StorageLocks, WorkerContext, resolve_destination};
