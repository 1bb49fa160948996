// ── Core error types ──
//
// Sync-level errors from hublink-core. Consumers never see socket or
// frame details directly: the `From<hublink_api::Error>` impl folds
// transport-layer failures into this taxonomy. Every variant has a
// stable machine code for response bodies.

use thiserror::Error;

use crate::model::{CapabilityType, ErrorBody};

/// Failure of one control command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("Capability {capability} is not supported by {entity_id}")]
    UnsupportedCapability {
        entity_id: String,
        capability: CapabilityType,
    },

    #[error("Execution failed: {message}")]
    ExecutionFailed { message: String },
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeviceNotFound { .. } => "device_not_found",
            Self::UnsupportedCapability { .. } => "unsupported_capability",
            Self::ExecutionFailed { .. } => "execution_failed",
        }
    }
}

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Link errors ──────────────────────────────────────────────────
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Protocol error ({code}): {message}")]
    Protocol { code: String, message: String },

    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // ── Sync errors ──────────────────────────────────────────────────
    #[error("Mapping error: {message}")]
    Mapping { message: String },

    #[error("Capability error: {message}")]
    Capability { message: String },

    #[error("Not synced: run a sync first")]
    NotSynced,

    #[error("Restore failed: {message}")]
    RestoreFailed { message: String },

    #[error(transparent)]
    Command(#[from] CommandError),

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl CoreError {
    /// Stable machine-checkable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport_error",
            Self::Authentication { .. } => "authentication_failed",
            Self::Protocol { .. } => "protocol_error",
            Self::Timeout { .. } => "timeout",
            Self::Mapping { .. } => "mapping_error",
            Self::Capability { .. } => "capability_error",
            Self::NotSynced => "not_synced",
            Self::RestoreFailed { .. } => "restore_failed",
            Self::Command(e) => e.code(),
            Self::Config { .. } => "config_error",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
    }

    pub(crate) fn restore_failed(cause: &impl std::fmt::Display) -> Self {
        Self::RestoreFailed {
            message: cause.to_string(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<hublink_api::Error> for CoreError {
    fn from(err: hublink_api::Error) -> Self {
        match err {
            hublink_api::Error::Authentication { message } => Self::Authentication { message },
            hublink_api::Error::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            hublink_api::Error::Protocol { code, message } => Self::Protocol { code, message },
            hublink_api::Error::Remote { message } => Self::Protocol {
                code: "remote_failure".into(),
                message,
            },
            hublink_api::Error::Deserialization { message, .. } => Self::Protocol {
                code: "malformed_response".into(),
                message,
            },
            hublink_api::Error::InvalidUrl(e) => Self::Config {
                message: e.to_string(),
            },
            hublink_api::Error::UnsupportedScheme { .. } => Self::Config {
                message: err.to_string(),
            },
            hublink_api::Error::Transport(_)
            | hublink_api::Error::NotConnected
            | hublink_api::Error::ConnectionClosed
            | hublink_api::Error::RetriesExhausted { .. } => Self::Transport {
                message: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Mapping {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_fold_into_taxonomy() {
        let timeout: CoreError = hublink_api::Error::Timeout { timeout_ms: 10 }.into();
        assert_eq!(timeout.code(), "timeout");

        let closed: CoreError = hublink_api::Error::ConnectionClosed.into();
        assert_eq!(closed.code(), "transport_error");
        assert!(closed.to_string().contains("connection closed"));

        let rejected: CoreError = hublink_api::Error::Remote {
            message: "unknown home".into(),
        }
        .into();
        assert_eq!(rejected.code(), "protocol_error");
    }

    #[test]
    fn command_errors_keep_their_codes() {
        let err: CoreError = CommandError::DeviceNotFound {
            device_id: "remote-9".into(),
        }
        .into();
        assert_eq!(err.code(), "device_not_found");
        assert_eq!(err.to_body().message, "Device not found: remote-9");
    }
}
