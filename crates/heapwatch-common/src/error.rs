//! Error types and result handling for the heapwatch agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for heapwatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for heapwatch agent operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Monitoring error: {0}")]
    Monitoring(String),

    #[error("Detection error: {0}")]
    Detection(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Profiling error: {0}")]
    Profiling(String),

    #[error("Reporting error: {0}")]
    Reporting(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid state transition: {0}")]
    State(String),

    #[error("Security violation: {0}")]
    Security(String),

    #[error("Performance error: {0}")]
    Performance(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Shutting down: {0}")]
    Shutdown(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl Error {
    /// Stable string code identifying the error class.
    ///
    /// Codes are part of the public contract: host code and remote
    /// subscribers match on them, so they never change across releases.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Monitoring(_) => "monitoring",
            Error::Detection(_) => "detection",
            Error::Analysis(_) => "analysis",
            Error::Profiling(_) => "profiling",
            Error::Reporting(_) => "reporting",
            Error::ResourceExhausted(_) => "resource-exhausted",
            Error::State(_) => "state",
            Error::Security(_) => "security",
            Error::Performance(_) => "performance",
            Error::Snapshot(_) => "snapshot",
            Error::Network(_) => "network",
            Error::Timeout(_) => "timeout",
            Error::Shutdown(_) => "shutdown",
            Error::Serialization(_) => "serialization",
            Error::Generic(_) => "generic",
        }
    }

    /// Check if the error is retryable by default
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout(_) | Error::ResourceExhausted(_)
        )
    }

    /// Errors that must surface to the host instead of being absorbed by
    /// a subsystem loop.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Error::Snapshot(_) | Error::Security(_) | Error::ResourceExhausted(_)
        )
    }

    /// Capture this error as a structured record for the error history
    /// and the event stream.
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            code: self.code().to_string(),
            message: self.to_string(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    /// Capture this error with additional context attached.
    pub fn to_record_with(&self, details: serde_json::Value) -> ErrorRecord {
        ErrorRecord {
            code: self.code().to_string(),
            message: self.to_string(),
            details: Some(details),
            timestamp: Utc::now(),
        }
    }
}

/// Structured error record carried by `error` / `critical-error` events
/// and retained in the supervisor's error history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}
