//! Error types for Cumulus
//!
//! This module defines the main error types used throughout Cumulus and the
//! transient/fatal classification that drives the retry machinery. Remote
//! failures raised by the user's own function are preserved field-for-field
//! (`name`, `message`, `stack`, string-valued properties) so the caller sees
//! the same error the function threw.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for Cumulus operations
pub type Result<T> = std::result::Result<T, CumulusError>;

/// Well-known property key under which a provider log URL is attached to a
/// remote failure, when the provider returned one.
pub const LOG_URL_PROPERTY: &str = "logUrl";

/// Classification of transport-level failures.
///
/// Transient kinds are fed back into the retry loop; fatal kinds surface
/// immediately regardless of the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Connection reset, DNS failure, broken pipe
    Network,
    /// Provider-side throttling or rate limiting
    Throttling,
    /// 5xx-class provider failure
    ServerError,
    /// Long poll failed without producing a batch
    QueueTimeout,
    /// Credentials rejected
    Authentication,
    /// Account or service quota exhausted
    QuotaExhausted,
    /// The provider rejected the request shape itself
    MalformedRequest,
}

impl TransportKind {
    /// Returns true if an error of this kind is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportKind::Network
                | TransportKind::Throttling
                | TransportKind::ServerError
                | TransportKind::QueueTimeout
        )
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Network => write!(f, "network"),
            TransportKind::Throttling => write!(f, "throttling"),
            TransportKind::ServerError => write!(f, "server error"),
            TransportKind::QueueTimeout => write!(f, "queue timeout"),
            TransportKind::Authentication => write!(f, "authentication"),
            TransportKind::QuotaExhausted => write!(f, "quota exhausted"),
            TransportKind::MalformedRequest => write!(f, "malformed request"),
        }
    }
}

/// An error raised by the user's function on the remote side.
///
/// Carried verbatim across the wire: `name`, `message`, the remote stack
/// trace when available, and any string-valued own properties the error
/// object exposed. A provider log URL, when known, is attached under
/// [`LOG_URL_PROPERTY`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserError {
    /// Error class name on the remote side (e.g. `TypeError`)
    pub name: String,
    /// Error message
    pub message: String,
    /// Remote stack trace, if the runtime produced one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// String-valued own properties of the remote error object
    #[serde(flatten)]
    pub properties: HashMap<String, String>,
}

impl UserError {
    /// Create a user error with a name and message
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            properties: HashMap::new(),
        }
    }

    /// Attach a remote stack trace
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach a string-valued property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The provider log URL attached to this error, if any
    pub fn log_url(&self) -> Option<&str> {
        self.properties.get(LOG_URL_PROPERTY).map(|s| s.as_str())
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// Main error type for Cumulus
#[derive(Error, Debug)]
pub enum CumulusError {
    /// The remote function itself raised. Never retried.
    #[error("{0}")]
    User(UserError),

    /// A transport-level failure talking to the provider
    #[error("transport error ({kind}): {detail}")]
    Transport {
        /// Failure classification
        kind: TransportKind,
        /// Human-readable detail
        detail: String,
    },

    /// No response arrived within the call's deadline
    #[error("function timed out after {elapsed_ms}ms (call {call_id})")]
    FunctionTimeout {
        /// The call that timed out
        call_id: String,
        /// Elapsed wall time when the deadline fired
        elapsed_ms: u64,
    },

    /// The provider gave up delivering the request after its own retries
    #[error("dead letter: {0}")]
    DeadLetter(String),

    /// The call was cancelled by `stop` before completing
    #[error("Rejected pending request")]
    Cancelled,

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (persistent cache, local plumbing)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Resource provisioning failed
    #[error("provisioning error: {0}")]
    Provision(String),

    /// Invariant violation inside the engine
    #[error("internal error: {0}")]
    Internal(String),

    /// A failure from a memoized task observed by multiple callers
    #[error(transparent)]
    Shared(Arc<CumulusError>),
}

impl CumulusError {
    /// Create a network transport error
    pub fn network(detail: impl Into<String>) -> Self {
        CumulusError::Transport {
            kind: TransportKind::Network,
            detail: detail.into(),
        }
    }

    /// Create a throttling transport error
    pub fn throttling(detail: impl Into<String>) -> Self {
        CumulusError::Transport {
            kind: TransportKind::Throttling,
            detail: detail.into(),
        }
    }

    /// Create a 5xx-class transport error
    pub fn server_error(detail: impl Into<String>) -> Self {
        CumulusError::Transport {
            kind: TransportKind::ServerError,
            detail: detail.into(),
        }
    }

    /// Create a queue-timeout transport error
    pub fn queue_timeout(detail: impl Into<String>) -> Self {
        CumulusError::Transport {
            kind: TransportKind::QueueTimeout,
            detail: detail.into(),
        }
    }

    /// Create an authentication transport error
    pub fn authentication(detail: impl Into<String>) -> Self {
        CumulusError::Transport {
            kind: TransportKind::Authentication,
            detail: detail.into(),
        }
    }

    /// Create a quota-exhausted transport error
    pub fn quota_exhausted(detail: impl Into<String>) -> Self {
        CumulusError::Transport {
            kind: TransportKind::QuotaExhausted,
            detail: detail.into(),
        }
    }

    /// Create a malformed-request transport error
    pub fn malformed(detail: impl Into<String>) -> Self {
        CumulusError::Transport {
            kind: TransportKind::MalformedRequest,
            detail: detail.into(),
        }
    }

    /// Create a configuration error with setting context
    pub fn config(setting: &str, reason: impl Into<String>) -> Self {
        CumulusError::Config(format!("{}: {}", setting, reason.into()))
    }

    /// Create an internal error
    pub fn internal(detail: impl Into<String>) -> Self {
        CumulusError::Internal(detail.into())
    }

    /// Returns true if the retry loop may reissue the failed operation.
    ///
    /// User errors, dead letters, cancellation, and fatal transport errors
    /// are final; timeouts stay retryable until the retry budget runs out.
    pub fn is_transient(&self) -> bool {
        match self {
            CumulusError::Transport { kind, .. } => kind.is_transient(),
            CumulusError::FunctionTimeout { .. } => true,
            CumulusError::Shared(inner) => inner.is_transient(),
            _ => false,
        }
    }

    /// The provider log URL attached to this error, if any
    pub fn log_url(&self) -> Option<&str> {
        match self {
            CumulusError::User(user) => user.log_url(),
            CumulusError::Shared(inner) => inner.log_url(),
            _ => None,
        }
    }
}

impl From<UserError> for CumulusError {
    fn from(value: UserError) -> Self {
        CumulusError::User(value)
    }
}

impl From<Arc<CumulusError>> for CumulusError {
    fn from(value: Arc<CumulusError>) -> Self {
        CumulusError::Shared(value)
    }
}
