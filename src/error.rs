use thiserror::Error;

/// Failure reported by a backend handler, classified for the retry decision.
#[derive(Debug, Clone, Error)]
#[error("{backend} backend error ({operation}, {}): {message}", retryability(.retryable))]
pub struct BackendError {
    pub backend: String,
    pub operation: &'static str,
    pub retryable: bool,
    pub message: String,
}

fn retryability(retryable: &bool) -> &'static str {
    if *retryable { "retryable" } else { "permanent" }
}

impl BackendError {
    pub fn retryable(
        backend: impl Into<String>,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            operation,
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(
        backend: impl Into<String>,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            operation,
            retryable: false,
            message: message.into(),
        }
    }

    /// Notes which of several recipients the failure hit.
    pub fn for_recipient(mut self, position: usize, total: usize) -> Self {
        if total > 1 {
            self.message = format!("recipient {} of {}: {}", position, total, self.message);
        }
        self
    }

    /// Non-2xx HTTP response from a provider.
    pub fn from_status(backend: &str, operation: &'static str, status: u16, body: &str) -> Self {
        let message = format!("request failed with status {}: {}", status, truncate(body, 256));

        if is_retryable_status(status) {
            Self::retryable(backend, operation, message)
        } else {
            Self::permanent(backend, operation, message)
        }
    }

    /// Transport-level failure. Connection and timeout problems are transient.
    /// Request construction errors mean the request itself is bad and are not.
    pub fn from_transport(backend: &str, operation: &'static str, err: &reqwest::Error) -> Self {
        if err.is_builder() {
            return Self::permanent(backend, operation, err.to_string());
        }

        if let Some(status) = err.status() {
            return Self::from_status(backend, operation, status.as_u16(), &err.to_string());
        }

        Self::retryable(backend, operation, err.to_string())
    }
}

/// 5xx, 408 and 429 are worth retrying; every other 4xx is a permanent
/// rejection of the request.
pub fn is_retryable_status(status: u16) -> bool {
    match status {
        500..=u16::MAX => true,
        408 | 429 => true,
        _ => false,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("context key '{key}' is not allowed by template '{template}'")]
    DisallowedKey { template: String, key: String },

    #[error("context key '{key}' must be a string, number, boolean or null")]
    UnsupportedValue { key: String },

    #[error("template '{template}' references missing variable '{key}'")]
    MissingVariable { template: String, key: String },

    #[error("template '{template}' has an unterminated placeholder")]
    Syntax { template: String },
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("at least one backend is required")]
    NoBackends,

    #[error("at least one recipient is required")]
    NoRecipients,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Why the worker gave up on a message. The display text becomes the
/// dead-letter `failure_reason`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("retries exhausted after {retry_count} retries: {last_error}")]
    Exhausted { retry_count: u32, last_error: String },
}
