//! Error types for the workload identity operator

use thiserror::Error;

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// GKE Hub answered with an error status
    #[error("federation API error ({status}): {message}")]
    Federation {
        /// HTTP status code, or the HTTP equivalent of an operation's RPC code
        status: u16,
        /// Message reported by the service
        message: String,
    },

    /// Request to an HTTP endpoint could not be completed
    #[error("transport error: {0}")]
    Transport(String),

    /// Workload cluster kubeconfig is missing or unusable
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Membership record has not been written to this cluster yet
    #[error("federation record not found: {0}")]
    FederationRecordMissing(String),

    /// Invalid configuration that needs an external fix
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a federation API error with the given status and message
    pub fn federation(status: u16, message: impl Into<String>) -> Self {
        Self::Federation {
            status,
            message: message.into(),
        }
    }

    /// Create a transport error with the given message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a kubeconfig error with the given message
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::Kubeconfig(msg.into())
    }

    /// Create a missing federation record error with the given message
    pub fn federation_record_missing(msg: impl Into<String>) -> Self {
        Self::FederationRecordMissing(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// HTTP status carried by the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(ae)) => Some(ae.code),
            Error::Federation { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for "already exists" answers from either Kubernetes or GKE Hub
    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }

    /// True for "not found" answers from either Kubernetes or GKE Hub
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// Whether re-running the failed step can succeed without outside changes
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Configuration(_) | Error::Kubeconfig(_))
    }
}
