//! Error types for the uesim operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries enough context to be surfaced verbatim in the
//! unit status message and in action responses.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for uesim operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Workload container or service is not yet available
    #[error("workload not ready [{unit}]: {message}")]
    NotReady {
        /// Name of the unit whose workload is not ready
        unit: String,
        /// Description of what is missing
        message: String,
    },

    /// Required relation data has not arrived yet
    #[error("missing relation data from '{relation}': {keys:?}")]
    MissingRelationData {
        /// Name of the relation (ConfigMap) that should carry the data
        relation: String,
        /// The mandatory keys that are absent
        keys: Vec<String>,
    },

    /// Rendered configuration failed validation
    #[error("invalid configuration field '{field}': {message}")]
    ConfigInvalid {
        /// The invalid field (e.g. "supi", "plmn-id")
        field: String,
        /// Description of what is malformed
        message: String,
    },

    /// Config file push into the workload failed
    #[error("config write to {path} failed: {message}")]
    Write {
        /// Target path inside the workload container
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Service restart inside the workload failed
    #[error("service restart failed [{service}]: {message}")]
    Restart {
        /// Name of the managed service
        service: String,
        /// Description of what failed
        message: String,
    },

    /// Failure specific to an action invocation
    #[error("action '{action}' failed: {message}")]
    Action {
        /// Name of the action (e.g. "start-ue")
        action: String,
        /// Description of what failed
        message: String,
        /// Whether the action was cut off by its timeout
        timed_out: bool,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "reconciler", "exec")
        context: String,
    },
}

impl Error {
    /// Create a not-ready error for the given unit
    pub fn not_ready(unit: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotReady {
            unit: unit.into(),
            message: msg.into(),
        }
    }

    /// Create a missing-relation-data error naming the absent keys
    pub fn missing_relation_data(
        relation: impl Into<String>,
        keys: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::MissingRelationData {
            relation: relation.into(),
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a config validation error for a specific field
    pub fn config_invalid(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a write error for the given target path
    pub fn write(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Write {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a restart error for the given service
    pub fn restart(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Restart {
            service: service.into(),
            message: msg.into(),
        }
    }

    /// Create an action error
    pub fn action(action: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Action {
            action: action.into(),
            message: msg.into(),
            timed_out: false,
        }
    }

    /// Create an action error caused by hitting the action timeout
    pub fn action_timeout(action: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Action {
            action: action.into(),
            message: msg.into(),
            timed_out: true,
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

    /// Check if this error is retryable
    ///
    /// Invalid configuration requires an external fix and is never
    /// retried automatically. Missing readiness or relation data resolves
    /// itself on a later event, and workload-side I/O failures are retried
    /// on the next pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout).
                // Don't retry on 4xx errors (validation, not found, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::NotReady { .. } => true,
            Error::MissingRelationData { .. } => true,
            Error::ConfigInvalid { .. } => false,
            Error::Write { .. } => true,
            Error::Restart { .. } => true,
            Error::Action { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error was caused by hitting a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Action { timed_out: true, .. })
    }
}
