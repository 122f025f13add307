//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings. Non-zero exit codes from
//! commands are normal results, not errors; the variants here cover
//! configuration, provisioning, and transport failures.

use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur during sandbox configuration and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// No configuration artifact was found at the given path.
    #[error("Configuration not found: {path}")]
    ConfigNotFound { path: String },

    /// The configuration was found but is malformed or violates an invariant.
    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    /// One or more services failed to provision.
    #[error(transparent)]
    Provision(#[from] ProvisionFailure),

    /// The remote provider is not running or not reachable.
    #[error("Provider is not available: {message}")]
    ProviderUnavailable { message: String },

    /// Transport or provider failure while executing a command.
    #[error("Command execution failed: {message}")]
    ExecFailure { message: String },

    /// A per-call timeout elapsed before the operation completed.
    #[error("Operation timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// File does not exist inside the container.
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// The container denied access to the path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    /// File transfer failed for a reason other than missing file or permissions.
    #[error("I/O failure: {message}")]
    IoFailure { message: String },

    /// The provider reclaimed the container (idle or overall timeout elapsed).
    #[error("Container is gone: {message}")]
    ContainerGone { message: String },

    /// The environment was used after its instance was torn down.
    #[error("Sandbox environment '{service}' has been released")]
    Released { service: String },

    /// The instance id already owns live containers.
    #[error("Instance '{instance_id}' is already active")]
    InstanceActive { instance_id: String },
}

impl SandboxError {
    /// Creates a `ConfigNotFound` error.
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }

    /// Creates a `ConfigInvalid` error.
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Creates a `ProviderUnavailable` error.
    pub fn provider_unavailable(message: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ExecFailure` error.
    pub fn exec_failure(message: impl Into<String>) -> Self {
        Self::ExecFailure {
            message: message.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates a `FileNotFound` error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates a `PermissionDenied` error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied { path: path.into() }
    }

    /// Creates an `IoFailure` error.
    pub fn io_failure(message: impl Into<String>) -> Self {
        Self::IoFailure {
            message: message.into(),
        }
    }

    /// Creates a `ContainerGone` error.
    pub fn container_gone(message: impl Into<String>) -> Self {
        Self::ContainerGone {
            message: message.into(),
        }
    }

    /// Creates a `Released` error.
    pub fn released(service: impl Into<String>) -> Self {
        Self::Released {
            service: service.into(),
        }
    }

    /// Creates an `InstanceActive` error.
    pub fn instance_active(instance_id: impl Into<String>) -> Self {
        Self::InstanceActive {
            instance_id: instance_id.into(),
        }
    }

    /// Returns true if this is a configuration error (not found or invalid).
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigNotFound { .. } | Self::ConfigInvalid { .. })
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the container backing an operation no longer exists.
    pub fn is_container_gone(&self) -> bool {
        matches!(self, Self::ContainerGone { .. })
    }

    /// Returns true if the environment was used after teardown.
    pub fn is_released(&self) -> bool {
        matches!(self, Self::Released { .. })
    }
}

/// Detail for a single service that failed to provision.
#[derive(Debug, Clone)]
pub struct ServiceFailure {
    /// Name of the service as declared in the manifest.
    pub service: String,
    /// Provider error message.
    pub message: String,
}

/// Aggregated provisioning failure.
///
/// Carries per-service detail so the coordinator can report which subset
/// failed while still tearing down the services that succeeded.
#[derive(Debug, thiserror::Error)]
#[error("Provisioning failed for {} of {requested} services", failures.len())]
pub struct ProvisionFailure {
    /// Total number of services requested.
    pub requested: usize,
    /// Number of services that provisioned successfully before teardown.
    pub succeeded: usize,
    /// Per-service failure detail.
    pub failures: Vec<ServiceFailure>,
}
