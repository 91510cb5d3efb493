//! Error types for the Caravel operator
//!
//! Errors are structured with fields to aid debugging in production.
//! The error taxonomy mirrors how the reconcilers react to failure:
//! retryable errors are requeued with backoff by the error policies,
//! non-retryable ones wait for a spec change.

use thiserror::Error;

/// Main error type for Caravel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Registry I/O error (network, 5xx, timeout, malformed response)
    #[error("registry error: {message}")]
    Registry {
        /// Description of what failed
        message: String,
        /// Whether this error is worth retrying
        retryable: bool,
    },

    /// The source image does not exist under the supplied credentials.
    ///
    /// Terminal for the reconcile attempt that hit it: retrying at full
    /// speed cannot help, but the condition is user-diagnosable and the
    /// resource is still re-checked on a slow cadence.
    #[error("source image not found: {reference}")]
    SourceMissing {
        /// The image reference that could not be resolved
        reference: String,
    },

    /// Unparseable image reference string
    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidReference {
        /// The offending reference string
        reference: String,
        /// Why parsing failed
        reason: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Context where the error occurred (e.g., "reconciler", "watcher")
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a retryable registry error
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable registry error (e.g., malformed manifest)
    pub fn registry_permanent(msg: impl Into<String>) -> Self {
        Self::Registry {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a source-missing error for the given reference
    pub fn source_missing(reference: impl Into<String>) -> Self {
        Self::SourceMissing {
            reference: reference.into(),
        }
    }

    /// Create an invalid-reference error
    pub fn invalid_reference(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Invalid references and serialization errors are not retryable
    /// (the input has to change). Source-missing is retryable on a slow
    /// cadence. Kubernetes errors depend on the status code: conflicts
    /// are retryable, other 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => false,
                _ => true,
            },
            Error::Registry { retryable, .. } => *retryable,
            Error::SourceMissing { .. } => true,
            Error::InvalidReference { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this is an optimistic-concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Check if this is a "source image not found" condition
    pub fn is_source_missing(&self) -> bool {
        matches!(self, Error::SourceMissing { .. })
    }
}
