//! Control channel between the page and the worker.
//!
//! The page sends `{"type": "..."}` objects; extra fields are ignored.
//! Replies are plain JSON objects whose shape depends on the command.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lifecycle::ServiceWorker;
use crate::network::Network;
use crate::storage::CacheStorage;

/// A command sent from the page to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Activate a waiting worker now. No reply.
    SkipWaiting,
    /// Reply with the primary partition name.
    GetVersion,
    /// Delete every partition, then reply with the outcome.
    ClearCache,
    /// Reply with the entry count of every partition.
    CacheStatus,
}

impl Command {
    /// Decodes a command from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Message`] for malformed JSON or unknown types.
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Message(e.to_string()))
    }

    /// Returns true if the command is answered on the reply channel.
    #[must_use]
    pub const fn expects_reply(self) -> bool {
        !matches!(self, Self::SkipWaiting)
    }
}

/// A reply sent back to the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    /// `{"version": "..."}`
    Version { version: String },
    /// `{"success": true}`, or `{"success": false, "error": "..."}`.
    Cleared {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// `{"status": {"name": count}}`
    Status { status: BTreeMap<String, usize> },
    /// `{"error": "..."}` when a status query fails.
    Failed { error: String },
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
    /// Handles one control-channel command.
    ///
    /// Storage failures are reported in the reply rather than dropped, so the
    /// page is never left waiting.
    pub async fn handle_message(&self, command: Command) -> Option<Reply> {
        match command {
            Command::SkipWaiting => {
                self.skip_waiting();
                None
            }
            Command::GetVersion => Some(Reply::Version {
                version: self.version().to_string(),
            }),
            Command::ClearCache => Some(match self.storage().clear().await {
                Ok(()) => {
                    log::info!("All caches cleared");
                    Reply::Cleared {
                        success: true,
                        error: None,
                    }
                }
                Err(e) => {
                    log::warn!("Clearing caches failed: {e}");
                    Reply::Cleared {
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            }),
            Command::CacheStatus => Some(match self.storage().status().await {
                Ok(status) => Reply::Status { status },
                Err(e) => {
                    log::warn!("Reading cache status failed: {e}");
                    Reply::Failed {
                        error: e.to_string(),
                    }
                }
            }),
        }
    }
}
