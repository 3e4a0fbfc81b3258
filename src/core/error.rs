//! Comprehensive error handling for the monitoring control plane.
//!
//! One enum covers every failure mode across storage, coordination, alert
//! evaluation and notification dispatch so callers and background loops can
//! reason about a single error taxonomy instead of one per subsystem.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for all monitor-core operations.
#[derive(Error, Debug)]
pub enum MonitorError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("Failed to create configuration directory: {path}")]
    ConfigDirCreation { path: PathBuf },

    // Storage engine errors (4.1)
    #[error("Storage write failed: {message}")]
    StorageWrite { message: String },

    #[error("Storage query failed: {message}")]
    StorageQuery { message: String },

    #[error("Failed to decode stored metric point: {message}")]
    StorageDecode { message: String },

    #[error("Retention compaction failed: {message}")]
    StorageCompaction { message: String },

    // Coordination store errors (rules + notifier configs)
    #[error("Coordination store unavailable: {message}")]
    CoordinationUnavailable { message: String },

    #[error("Coordination watch channel closed")]
    CoordinationWatchClosed,

    #[error("Failed to decode coordination store entry {key}: {message}")]
    CoordinationDecode { key: String, message: String },

    // Alert manager errors (4.3)
    #[error("Alert rule not found: {id}")]
    RuleNotFound { id: String },

    #[error("Invalid alert rule: {message}")]
    RuleInvalid { message: String },

    #[error("Alert not found: {key}")]
    AlertNotFound { key: String },

    #[error("Failed to parse rule duration '{value}'")]
    DurationParse { value: String },

    // Notifier manager errors (4.4)
    #[error("Notifier not found: {id}")]
    NotifierNotFound { id: String },

    #[error("Invalid notifier configuration: {message}")]
    NotifierInvalid { message: String },

    #[error("Unknown notifier type: {kind}")]
    UnknownNotifierType { kind: String },

    #[error("Channel send failed for {channel_id}: {message}")]
    ChannelSend { channel_id: String, message: String },

    #[error("Template render failed: {message}")]
    TemplateRender { message: String },

    // Node allocator errors (4.2)
    #[error("No online storage node available for service {service}")]
    NoCandidateNode { service: String },

    #[error("Service registry unavailable: {message}")]
    RegistryUnavailable { message: String },

    // Distributed lock errors (5)
    #[error("Failed to acquire lock {key}: {message}")]
    LockAcquire { key: String, message: String },

    #[error("Lock session lost: {message}")]
    LockSessionLost { message: String },

    #[error("Lock {key} not held by this owner")]
    LockNotHeld { key: String },

    // Network / transport errors
    #[error("HTTP request failed: {url} - {status}")]
    HttpRequest { url: String, status: u16 },

    #[error("gRPC transport error: {message}")]
    GrpcTransport { message: String },

    // Generic errors
    #[error("Operation '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error in {context}: {message}")]
    Internal { context: String, message: String },
}

impl MonitorError {
    /// Create an internal error with a free-form context label.
    pub fn internal(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a not-found error pinned to a rule id.
    pub fn rule_not_found(id: impl Into<String>) -> Self {
        Self::RuleNotFound { id: id.into() }
    }

    /// Create a not-found error pinned to a notifier id.
    pub fn notifier_not_found(id: impl Into<String>) -> Self {
        Self::NotifierNotFound { id: id.into() }
    }

    /// §7 error-kind classification, used for HTTP status mapping and metrics.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigInvalid { .. }
            | Self::RuleInvalid { .. }
            | Self::NotifierInvalid { .. }
            | Self::UnknownNotifierType { .. }
            | Self::InvalidInput { .. }
            | Self::DurationParse { .. } => ErrorCategory::InvalidInput,

            Self::StorageWrite { .. }
            | Self::StorageQuery { .. }
            | Self::StorageCompaction { .. }
            | Self::CoordinationUnavailable { .. }
            | Self::CoordinationWatchClosed
            | Self::RegistryUnavailable { .. }
            | Self::GrpcTransport { .. }
            | Self::HttpRequest { .. } => ErrorCategory::TransientIo,

            Self::RuleNotFound { .. }
            | Self::AlertNotFound { .. }
            | Self::NotifierNotFound { .. }
            | Self::NoCandidateNode { .. } => ErrorCategory::NotFound,

            Self::Timeout { .. } | Self::LockAcquire { .. } => ErrorCategory::Timeout,

            Self::ConfigNotFound { .. }
            | Self::ConfigDirCreation { .. }
            | Self::CoordinationDecode { .. }
            | Self::StorageDecode { .. } => ErrorCategory::ConfigDecode,

            Self::ChannelSend { .. } | Self::TemplateRender { .. } => ErrorCategory::ChannelSend,

            Self::LockSessionLost { .. } | Self::LockNotHeld { .. } | Self::Internal { .. } => {
                ErrorCategory::System
            }
        }
    }

    /// Whether a background loop should retry after logging this error
    /// rather than treat it as fatal. Mirrors §7's propagation policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::TransientIo | ErrorCategory::Timeout)
    }
}

/// §7 error-kind taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    InvalidInput,
    TransientIo,
    NotFound,
    Timeout,
    ConfigDecode,
    ChannelSend,
    System,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidInput => "invalid_input",
            Self::TransientIo => "transient_io",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::ConfigDecode => "config_decode",
            Self::ChannelSend => "channel_send",
            Self::System => "system",
        };
        write!(f, "{s}")
    }
}

impl From<io::Error> for MonitorError {
    fn from(err: io::Error) -> Self {
        Self::Internal {
            context: "io".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigInvalid {
            message: format!("JSON error: {err}"),
        }
    }
}

impl From<toml::de::Error> for MonitorError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigInvalid {
            message: format!("TOML parsing error: {err}"),
        }
    }
}

impl From<toml::ser::Error> for MonitorError {
    fn from(err: toml::ser::Error) -> Self {
        Self::ConfigInvalid {
            message: format!("TOML serialization error: {err}"),
        }
    }
}

impl From<sled::Error> for MonitorError {
    fn from(err: sled::Error) -> Self {
        Self::StorageWrite {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                operation: "http".to_string(),
                seconds: 30,
            }
        } else if let Some(status) = err.status() {
            Self::HttpRequest {
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
                status: status.as_u16(),
            }
        } else {
            Self::Internal {
                context: "http".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<tonic::Status> for MonitorError {
    fn from(status: tonic::Status) -> Self {
        Self::GrpcTransport {
            message: status.to_string(),
        }
    }
}

impl From<tonic::transport::Error> for MonitorError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::GrpcTransport {
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for MonitorError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal {
            context: "task".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<etcd_client::Error> for MonitorError {
    fn from(err: etcd_client::Error) -> Self {
        Self::CoordinationUnavailable {
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for MonitorError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            context: "anyhow".to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_classification() {
        let err = MonitorError::rule_not_found("r1");
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert!(!err.is_retryable());

        let err = MonitorError::StorageQuery {
            message: "boom".into(),
        };
        assert_eq!(err.category(), ErrorCategory::TransientIo);
        assert!(err.is_retryable());
    }

    #[test]
    fn invalid_input_is_not_retryable() {
        let err = MonitorError::invalid_input("bad filter");
        assert!(!err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::InvalidInput);
    }
}
