//! Error types for the machine sync operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the machine or resource it concerns so that the
//! reconcile log line and the Synchronized condition can name it.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for machine sync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Unsupported shape of a machine (owner references, platform invariants)
    ///
    /// Terminal: retrying without an operator changing the object cannot succeed.
    #[error("validation error for {machine}: {message}")]
    Validation {
        /// Name of the machine that failed validation
        machine: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "metadata.ownerReferences")
        field: Option<String>,
    },

    /// A conversion function rejected the payload
    #[error("conversion error for {machine}: {message}")]
    Conversion {
        /// Name of the machine being converted
        machine: String,
        /// Aggregated field errors reported by the conversion
        message: String,
    },

    /// An object expected to exist in the other model is absent
    ///
    /// Recoverable: the counterpart is usually created by another controller
    /// (e.g. a machine set migrated later).
    #[error("{kind} {name} not found")]
    MissingCounterpart {
        /// Kind of the missing object
        kind: String,
        /// Name of the missing object
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// The original failure, plus a failure to record it on the Synchronized condition
    #[error("{original}; additionally failed to write Synchronized condition: {condition}")]
    ConditionWrite {
        /// The failure that was being reported
        original: Box<Error>,
        /// The failure of the condition write itself
        condition: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "deletion")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            machine: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with machine context
    pub fn validation_for(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            machine: machine.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with machine context and field path
    pub fn validation_for_field(
        machine: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            machine: machine.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conversion error for a machine
    pub fn conversion_for(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conversion {
            machine: machine.into(),
            message: msg.into(),
        }
    }

    /// Create a missing-counterpart error
    pub fn missing_counterpart(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::MissingCounterpart {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Attach a failed condition write to this error
    ///
    /// Both failures are kept so the root cause stays visible to operators.
    pub fn with_condition_failure(self, condition: Error) -> Self {
        Self::ConditionWrite {
            original: Box::new(self),
            condition: Box::new(condition),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, conversion and serialization errors need the object to
    /// change first. Kubernetes errors are retried except for 4xx responses
    /// other than conflicts and not-found (both resolve on a fresh read).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 404
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Conversion { .. } => false,
            Error::MissingCounterpart { .. } => true,
            Error::Serialization { .. } => false,
            Error::ConditionWrite { original, .. } => original.is_retryable(),
            Error::Internal { .. } => true,
        }
    }

    /// True for failures that are reported on the condition and not requeued
    pub fn is_terminal(&self) -> bool {
        match self {
            Error::Validation { .. } | Error::Conversion { .. } => true,
            Error::ConditionWrite { original, .. } => original.is_terminal(),
            _ => false,
        }
    }

    /// True if the store reported the object as absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True if an optimistic-concurrency check failed (stale resource version)
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            Error::ConditionWrite { original, .. } => original.is_conflict(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("{reason} for test"),
                reason: reason.to_string(),
                code,
            }),
        }
    }

    /// Story: owner-reference shape problems stop the pass without retrying
    #[test]
    fn story_validation_errors_are_terminal() {
        let err = Error::validation_for_field(
            "worker-a",
            "metadata.ownerReferences",
            "too many owner references",
        );
        assert!(err.to_string().contains("worker-a"));
        assert!(err.to_string().contains("too many owner references"));
        assert!(err.is_terminal());
        assert!(!err.is_retryable());

        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("metadata.ownerReferences"))
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    #[test]
    fn conversion_errors_are_terminal() {
        let err = Error::conversion_for("worker-a", "spec.providerSpec.value.instanceType: Required");
        assert!(err.is_terminal());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("instanceType"));
    }

    /// Story: a machine set that hasn't been migrated yet is only a matter of time
    #[test]
    fn story_missing_counterpart_is_retried() {
        let err = Error::missing_counterpart("MachineSet", "workers-us-east-1a");
        assert!(err.is_retryable());
        assert!(!err.is_terminal());
        assert_eq!(err.to_string(), "MachineSet workers-us-east-1a not found");
    }

    #[test]
    fn conflicts_and_not_found_are_retryable() {
        let conflict = api_error(409, "Conflict");
        assert!(conflict.is_conflict());
        assert!(conflict.is_retryable());

        let missing = api_error(404, "NotFound");
        assert!(missing.is_not_found());
        assert!(missing.is_retryable());

        let forbidden = api_error(403, "Forbidden");
        assert!(!forbidden.is_retryable());

        let server = api_error(500, "InternalError");
        assert!(server.is_retryable());
    }

    /// Story: losing the condition write must not hide why the sync failed
    #[test]
    fn story_condition_write_failure_keeps_root_cause() {
        let original = Error::validation_for("worker-a", "unsupported owner kind");
        let err = original.with_condition_failure(api_error(409, "Conflict"));

        let message = err.to_string();
        assert!(message.contains("unsupported owner kind"));
        assert!(message.contains("Synchronized condition"));
        assert!(err.is_terminal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_internal_error_with_context() {
        let err = Error::internal_with_context("deletion", "unexpected state");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[deletion]"));
        assert!(Error::internal("boom").to_string().contains("[unknown]"));
    }

    #[test]
    fn serialization_errors_are_not_retryable() {
        let err = Error::serialization_for_kind("AWSMachine", "missing field `spec`");
        assert!(!err.is_retryable());
        match &err {
            Error::Serialization { kind, .. } => assert_eq!(kind.as_deref(), Some("AWSMachine")),
            _ => panic!("Expected Serialization variant"),
        }
    }
}
