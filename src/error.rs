//! Error taxonomy for broker connection management
//!
//! Transport-level failures are mapped into [`ManagerError`] at the lifecycle
//! boundary so observers see one vocabulary regardless of the transport in use.

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for connection manager operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("Transport construction failed: {detail}")]
    TransportConstructionFailed { detail: String },

    #[error("Handshake failed: {detail}")]
    HandshakeFailed { detail: String },

    #[error("Publish to '{topic}' skipped: client is not connected")]
    PublishSkippedNotConnected { topic: String },

    #[error("Connection lost unexpectedly: {detail}")]
    ConnectionLostUnexpectedly { detail: String },

    #[error("Connection task ended without reporting: {detail}")]
    TaskAborted { detail: String },

    #[error("No tokio runtime available: {detail}")]
    RuntimeUnavailable { detail: String },

    #[error("Configuration error: {detail}")]
    Config { detail: String },
}

impl ManagerError {
    pub fn transport_construction_failed<S: Into<String>>(detail: S) -> Self {
        Self::TransportConstructionFailed {
            detail: detail.into(),
        }
    }

    pub fn handshake_failed<S: Into<String>>(detail: S) -> Self {
        Self::HandshakeFailed {
            detail: detail.into(),
        }
    }

    pub fn publish_skipped<S: Into<String>>(topic: S) -> Self {
        Self::PublishSkippedNotConnected {
            topic: topic.into(),
        }
    }

    pub fn connection_lost<S: Into<String>>(detail: S) -> Self {
        Self::ConnectionLostUnexpectedly {
            detail: detail.into(),
        }
    }

    pub fn task_aborted<S: Into<String>>(detail: S) -> Self {
        Self::TaskAborted {
            detail: detail.into(),
        }
    }

    /// Whether this error ends a connection attempt
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            ManagerError::TransportConstructionFailed { .. }
                | ManagerError::HandshakeFailed { .. }
                | ManagerError::TaskAborted { .. }
        )
    }
}

impl From<ConfigError> for ManagerError {
    fn from(error: ConfigError) -> Self {
        ManagerError::Config {
            detail: error.to_string(),
        }
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_detail() {
        let errors = vec![
            ManagerError::transport_construction_failed("bad host"),
            ManagerError::handshake_failed("refused"),
            ManagerError::publish_skipped("sensor/a"),
            ManagerError::connection_lost("reset by peer"),
            ManagerError::task_aborted("panicked"),
        ];

        for error in errors {
            let rendered = error.to_string();
            assert!(!rendered.is_empty());
        }

        assert!(ManagerError::handshake_failed("refused")
            .to_string()
            .contains("refused"));
        assert!(ManagerError::publish_skipped("sensor/a")
            .to_string()
            .contains("sensor/a"));
    }

    #[test]
    fn test_connect_failure_classification() {
        assert!(ManagerError::transport_construction_failed("x").is_connect_failure());
        assert!(ManagerError::handshake_failed("x").is_connect_failure());
        assert!(!ManagerError::publish_skipped("t").is_connect_failure());
        assert!(!ManagerError::connection_lost("x").is_connect_failure());
    }

    #[test]
    fn test_config_error_conversion() {
        let error: ManagerError = ConfigError::InvalidConfig("port".to_string()).into();
        assert!(matches!(error, ManagerError::Config { .. }));
        assert!(error.to_string().contains("port"));
    }
}
