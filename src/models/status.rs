use std::{
    fmt::{Display, Formatter, Result},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl Display for OutboxStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            OutboxStatus::Pending => write!(f, "pending"),
            OutboxStatus::Published => write!(f, "published"),
            OutboxStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "published" => Ok(OutboxStatus::Published),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(anyhow::anyhow!("Unknown outbox status '{}'", other)),
        }
    }
}

/// Result of claiming a dedup key in the deduplication store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupClaim {
    /// First sighting of this content.
    Claimed,
    /// The key is held by this same message id: a broker redelivery.
    Redelivery,
    /// The key is held by a different message with identical content.
    Duplicate,
}

/// States a message passes through inside the delivery worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Received,
    DuplicateSkipped,
    Deduplicating,
    Decrypted,
    Dispatching,
    AllSucceeded,
    PartiallySucceeded,
    AllFailed,
}

impl Display for ProcessingState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let s = match self {
            ProcessingState::Received => "received",
            ProcessingState::DuplicateSkipped => "duplicate_skipped",
            ProcessingState::Deduplicating => "deduplicating",
            ProcessingState::Decrypted => "decrypted",
            ProcessingState::Dispatching => "dispatching",
            ProcessingState::AllSucceeded => "all_succeeded",
            ProcessingState::PartiallySucceeded => "partially_succeeded",
            ProcessingState::AllFailed => "all_failed",
        };
        f.write_str(s)
    }
}
