use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

/// Every failure the driver reports to the host.
///
/// Validation and decode errors are raised before any remote side effect.
/// `Transient` is the only variant retried internally; everything else is surfaced
/// unchanged with enough context (operation, remote id, provider detail) for the host
/// to decide on retry or alerting.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("driver is not initialized")]
    NotInitialized,

    #[error("driver is already initialized")]
    AlreadyInitialized,

    #[error("transient failure during {operation}: {message}")]
    Transient {
        operation: String,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("instance {remote_id} entered state '{status}'")]
    RemoteState { remote_id: String, status: String },

    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },

    #[error("malformed provider metadata: {0}")]
    Decode(String),

    #[error("workspace {workspace_id} is not ready (status: {status})")]
    WorkspaceNotReady { workspace_id: String, status: String },

    #[error("{operation} on {remote_id} timed out after {waited:?}")]
    Timeout {
        operation: String,
        remote_id: String,
        waited: Duration,
    },

    #[error("{operation} cancelled")]
    Cancelled {
        operation: String,
        remote_id: Option<String>,
    },

    #[error("{operation} failed: status={status} body={body}")]
    Api {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("remote command {operation} failed (exit={exit_code:?}): {stderr}")]
    RemoteCommand {
        operation: String,
        exit_code: Option<i32>,
        stderr: String,
    },
}

impl DriverError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.to_string(),
            retry_after: None,
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Hint from the remote side (e.g. `Retry-After`) for the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Stable snake_case name, used as the `kind` field of host-facing errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotInitialized => "not_initialized",
            Self::AlreadyInitialized => "already_initialized",
            Self::Transient { .. } => "transient_transport_error",
            Self::RemoteState { .. } => "remote_state_error",
            Self::NotFound { .. } => "not_found",
            Self::Decode(_) => "decode_error",
            Self::WorkspaceNotReady { .. } => "workspace_not_ready",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Api { .. } => "api_error",
            Self::RemoteCommand { .. } => "remote_command_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_carries_retry_hint() {
        let err = DriverError::Transient {
            operation: "get_instance".into(),
            message: "429".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(err.kind(), "transient_transport_error");
    }

    #[test]
    fn not_found_is_only_not_found() {
        let err = DriverError::not_found("droplet", "42");
        assert!(err.is_not_found());
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "droplet 42 not found");
    }

    #[test]
    fn short_timeouts_keep_their_unit() {
        let err = DriverError::Timeout {
            operation: "await_active".into(),
            remote_id: "3000001".into(),
            waited: Duration::from_millis(50),
        };
        assert_eq!(err.to_string(), "await_active on 3000001 timed out after 50ms");

        let err = DriverError::Timeout {
            operation: "await_active".into(),
            remote_id: "3000001".into(),
            waited: Duration::from_secs(600),
        };
        assert_eq!(err.to_string(), "await_active on 3000001 timed out after 600s");
    }
}
