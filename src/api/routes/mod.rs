//! Route handlers for the REST API
//!
//! Handlers are organized by domain:
//! - [`mining`]: task creation, lookup, deletion and live streams
//! - [`system`]: health and OpenAPI

use crate::types::{MailboxCredentials, MiningOptions, TaskId};
use serde::{Deserialize, Serialize};

mod mining;
mod system;

pub use mining::*;
pub use system::*;

/// Request body for POST /mine
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct CreateMiningRequest {
    /// Owner of the task
    pub user_id: String,
    /// Mailbox to mine
    pub mailbox: MailboxCredentials,
    /// Folders to fetch
    pub folders: Vec<String>,
}

impl CreateMiningRequest {
    /// Split into the owning user and the mining options
    pub fn into_parts(self) -> (String, MiningOptions) {
        (
            self.user_id,
            MiningOptions {
                mailbox: self.mailbox,
                folders: self.folders,
            },
        )
    }
}

/// Successful response envelope: `{"data": ...}`
#[derive(Debug, Deserialize, Serialize)]
pub struct DataResponse<T> {
    /// Payload
    pub data: T,
}

/// Payload of DELETE /mine/:id
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct DeletedTask {
    /// Deleted task
    pub id: TaskId,
    /// Always true
    pub deleted: bool,
}
