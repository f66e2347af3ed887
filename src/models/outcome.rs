use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::BackendError, models::status::ProcessingState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOutcome {
    pub backend_name: String,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retryable: bool,
}

impl BackendOutcome {
    pub fn succeeded(backend_name: impl Into<String>) -> Self {
        Self {
            backend_name: backend_name.into(),
            success: true,
            error: None,
            retryable: false,
        }
    }

    pub fn failed(backend_name: impl Into<String>, error: &BackendError) -> Self {
        Self {
            backend_name: backend_name.into(),
            success: false,
            error: Some(error.to_string()),
            retryable: error.retryable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub message_id: Uuid,
    pub outcomes: Vec<BackendOutcome>,
}

impl DeliveryResult {
    pub fn new(message_id: Uuid, outcomes: Vec<BackendOutcome>) -> Self {
        Self {
            message_id,
            outcomes,
        }
    }

    pub fn failed_backends(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| o.backend_name.clone())
            .collect()
    }

    /// True when any failure cannot be fixed by retrying.
    pub fn has_permanent_failure(&self) -> bool {
        self.outcomes.iter().any(|o| !o.success && !o.retryable)
    }

    pub fn state(&self) -> ProcessingState {
        let failed = self.outcomes.iter().filter(|o| !o.success).count();

        if failed == 0 {
            ProcessingState::AllSucceeded
        } else if failed == self.outcomes.len() {
            ProcessingState::AllFailed
        } else {
            ProcessingState::PartiallySucceeded
        }
    }

    /// Joined error text of every failed backend, for `last_error`.
    pub fn error_summary(&self) -> String {
        self.outcomes
            .iter()
            .filter_map(|o| o.error.as_deref())
            .collect::<Vec<_>>()
            .join("; ")
    }
}
