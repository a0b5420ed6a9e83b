//! # mailbox-miner
//!
//! Mailbox ingestion for a contact-mining pipeline.
//!
//! A mining task opens a bounded pool of IMAP sessions to one mailbox, splits
//! the selected folders into sequence-number chunks and fetches them in
//! parallel. Parsed headers and bodies are appended to per-task broker topics
//! that downstream stages (contact extraction, signature mining, email
//! verification) consume through consumer groups. Stages report progress back
//! on a pub/sub channel, which the miner folds into counters and streams to
//! HTTP clients over server-sent events.
//!
//! ## Quick Start
//!
//! ```no_run
//! use mailbox_miner::{Config, MailboxMiner, run_with_shutdown};
//! use mailbox_miner::types::{MailboxCredentials, MiningOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let miner = MailboxMiner::with_memory_broker(Config::default())?;
//!
//!     let task = miner
//!         .create_task(
//!             "user-1",
//!             MiningOptions {
//!                 mailbox: MailboxCredentials::Password {
//!                     email: "me@example.com".to_string(),
//!                     host: "imap.example.com".to_string(),
//!                     port: "993".to_string(),
//!                     password: "secret".to_string(),
//!                 },
//!                 folders: vec!["INBOX".to_string()],
//!             },
//!         )
//!         .await?;
//!
//!     let mut stream = miner.attach_stream(&task.id).await?;
//!     while let Ok(event) = stream.events.recv().await {
//!         println!("{}: {:?}", event.name(), event);
//!     }
//!
//!     run_with_shutdown(miner).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API module
pub mod api;
/// Message broker: topics, consumer groups, pub/sub and the pipeline registry
pub mod broker;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Chunked mailbox fetcher
pub mod fetcher;
/// IMAP sessions, connection pool and OAuth token refresh
pub mod imap;
/// Mining task lifecycle manager
pub mod miner;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use broker::{Broker, MemoryBroker, PipelineRegistry, StageProcessor, StageWorker};
pub use config::Config;
pub use error::{ApiError, Error, Result, ToHttpStatus};
pub use fetcher::{ChunkedMailboxFetcher, FetchOutcome};
pub use imap::ConnectionPool;
pub use miner::{MailboxMiner, StreamGuard, TaskStream};
pub use types::{
    MailboxCredentials, MiningOptions, MiningTask, ProgressEvent, ProgressType, TaskEvent,
    TaskId, TaskStatus,
};

/// Helper function to run the miner with graceful signal handling.
///
/// Waits for a termination signal and then calls the miner's `shutdown()`
/// method, which cancels every active task.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use mailbox_miner::{Config, MailboxMiner, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let miner = MailboxMiner::with_memory_broker(Config::default())?;
///     let _api = miner.spawn_api_server();
///
///     run_with_shutdown(miner).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(miner: MailboxMiner) -> Result<()> {
    wait_for_signal().await;
    miner.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
