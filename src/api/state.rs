//! Application state for the API server

use crate::{Config, MailboxMiner};
use std::sync::Arc;

/// Shared application state accessible to all route handlers
///
/// This struct is cloned for each request (cheap Arc clone) and provides
/// access to the miner and configuration.
#[derive(Clone)]
pub struct AppState {
    /// The mining task manager
    pub miner: Arc<MailboxMiner>,

    /// Configuration (read-only)
    pub config: Arc<Config>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(miner: Arc<MailboxMiner>, config: Arc<Config>) -> Self {
        Self { miner, config }
    }
}
