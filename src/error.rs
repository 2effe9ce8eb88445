//! Error types for the Talos cluster provider
//!
//! Provides structured error types for the actuators, provisioners,
//! bootstrap material generation and the config record store.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the provider
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    // =========================================================================
    // Resource Spec Errors
    // =========================================================================
    #[error("Invalid provider spec for {kind}/{name}: {reason}")]
    InvalidProviderSpec {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Malformed machine name {name}: {reason}")]
    MalformedMachineName { name: String, reason: String },

    // =========================================================================
    // Provisioner Errors
    // =========================================================================
    #[error("Unknown provisioner: {backend}")]
    UnknownBackend { backend: String },

    #[error("No client configured for backend: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Cloud API error: {backend} - {operation}: {reason}")]
    Cloud {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("External address {name} not ready")]
    AddressNotReady { name: String },

    #[error("Instance conflict for machine {machine}: {reason}")]
    InstanceConflict { machine: String, reason: String },

    #[error("Deletion of {resource} still in progress on {backend}")]
    DeletionInProgress { backend: String, resource: String },

    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout { operation: String, after: Duration },

    #[error("Cancelled while waiting for {operation}")]
    Cancelled { operation: String },

    // =========================================================================
    // Cluster Lifecycle Errors
    // =========================================================================
    #[error("Machines exist for cluster {cluster} ({count}), refusing to delete")]
    DependentsExist { cluster: String, count: usize },

    // =========================================================================
    // Bootstrap Errors
    // =========================================================================
    #[error("Certificate generation failed: {0}")]
    Certificate(String),

    #[error("Template rendering failed: {0}")]
    Template(#[from] minijinja::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Address parse error: {0}")]
    AddressParse(#[from] std::net::AddrParseError),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Build a cloud API error for the given backend operation
    pub fn cloud(
        backend: impl Into<String>,
        operation: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Error::Cloud {
            backend: backend.into(),
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a not-found error for the given resource
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Build an already-exists error for the given resource
    pub fn exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // In-flight cloud deletes settle on their own
            Error::DeletionInProgress { .. } => ErrorAction::RequeueAfter(Duration::from_secs(10)),

            // Waiting gave up, give the backend time before trying again
            Error::Timeout { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Invariant violations - retrying does not resolve them
            Error::DependentsExist { .. }
            | Error::AddressNotReady { .. }
            | Error::InvalidProviderSpec { .. }
            | Error::MalformedMachineName { .. }
            | Error::InstanceConflict { .. }
            | Error::UnknownBackend { .. }
            | Error::BackendUnavailable { .. }
            | Error::Configuration(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error reports a missing resource
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }

    /// Check if this error reports a resource that already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::ResourceExists { .. } => true,
            Error::Kube(kube::Error::Api(response)) => response.code == 409,
            _ => false,
        }
    }
}

/// Result type alias for the provider
pub type Result<T> = std::result::Result<T, Error>;
