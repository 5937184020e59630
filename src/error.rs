//! Error types for the triage service.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Classification failed: {0}")]
    Classification(#[from] ClassificationFailure),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of the external classification capability.
///
/// Always returned as a value; the pipeline treats it as a normal outcome and
/// degrades to the fallback classification.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassificationFailure {
    #[error("classifier {classifier} timed out after {after:?}")]
    Timeout { classifier: String, after: Duration },

    #[error("classifier {classifier} transport error: {reason}")]
    Transport { classifier: String, reason: String },

    #[error("classifier {classifier} returned an invalid response: {reason}")]
    InvalidResponse { classifier: String, reason: String },

    #[error("classifier {classifier} unavailable: {reason}")]
    Unavailable { classifier: String, reason: String },
}

impl ClassificationFailure {
    /// Short machine-readable reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Transport { .. } => "transport",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::Unavailable { .. } => "unavailable",
        }
    }
}

/// Malformed input: a report that cannot be accepted, or an update that would
/// break an entity invariant.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Report description must not be empty")]
    EmptyDescription,

    #[error("Report description too long: {length} > {max} characters")]
    DescriptionTooLong { length: usize, max: usize },

    #[error("Report title too long: {length} > {max} characters")]
    TitleTooLong { length: usize, max: usize },

    #[error("Submitter reference must not be empty")]
    MissingSubmitter,

    #[error("Invalid coordinate ({latitude}, {longitude})")]
    InvalidCoordinate { latitude: f64, longitude: f64 },

    #[error("Latitude and longitude must be provided together")]
    PartialCoordinate,

    #[error("Invalid radius {radius_km} km")]
    InvalidRadius { radius_km: f64 },

    #[error("Occupancy {occupancy} outside [0, {capacity}]")]
    OccupancyOutOfRange { occupancy: i64, capacity: u32 },

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Report {id} is already resolved")]
    ReportClosed { id: Uuid },

    #[error("{field} must not be empty")]
    MissingField { field: &'static str },
}

/// A failed notification send.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// Bad recipient, malformed payload, unsupported audience. Never retried.
    #[error("permanent failure on {channel}: {reason}")]
    Permanent { channel: String, reason: String },

    /// Timeout, rate limit, transient server error. Retried with backoff.
    #[error("retriable failure on {channel}: {reason}")]
    Retriable { channel: String, reason: String },
}

impl DispatchError {
    pub fn permanent(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permanent {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn retriable(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Retriable {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retriable { .. })
    }
}

/// Incident state store errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// An update would violate an entity invariant given its current state.
    #[error("State conflict on {entity} {id}: {reason}")]
    Conflict {
        entity: &'static str,
        id: Uuid,
        reason: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The backing storage layer rejected the write. Nothing can be published.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Triage orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Triage cycle for report {report_id} cannot move from {from} to {to}")]
    InvalidTransition {
        report_id: Uuid,
        from: String,
        to: String,
    },
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_error_retriable_flag() {
        assert!(DispatchError::retriable("sms", "429").is_retriable());
        assert!(!DispatchError::permanent("sms", "bad number").is_retriable());
    }

    #[test]
    fn classification_failure_reason_codes() {
        let failure = ClassificationFailure::Timeout {
            classifier: "gemini".into(),
            after: Duration::from_secs(8),
        };
        assert_eq!(failure.reason_code(), "timeout");
        assert!(failure.to_string().contains("timed out"));
    }

    #[test]
    fn store_error_wraps_validation() {
        let err: StoreError = ValidationError::OccupancyOutOfRange {
            occupancy: 120,
            capacity: 100,
        }
        .into();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(err.to_string(), "Occupancy 120 outside [0, 100]");
    }
}
