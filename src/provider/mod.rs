//! Capability interface to the remote compute provider.
//!
//! The core drives containers exclusively through [`ContainerProvider`];
//! everything provider-specific (image handling, exec transport, file
//! transfer) lives behind this seam. [`DockerProvider`] is the concrete
//! implementation; [`MockProvider`] is a scriptable stand-in for tests.

pub mod docker;
pub mod mock;

pub use docker::DockerProvider;
pub use mock::MockProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::spec::ContainerSpec;

/// Opaque reference to a live remote container.
///
/// Exists only between a successful creation and a terminate attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Provider-assigned container id.
    pub provider_id: String,
    /// Service name this container backs.
    pub service: String,
    /// Instance that owns the container.
    pub instance_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ContainerHandle {
    /// Creates a handle for a freshly provisioned container.
    pub fn new(
        provider_id: impl Into<String>,
        service: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            service: service.into(),
            instance_id: instance_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// A command to run inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// Command and arguments.
    pub command: Vec<String>,
    /// Absolute working directory; `None` uses the container default.
    pub workdir: Option<String>,
    /// Environment overrides for this call only.
    pub env: BTreeMap<String, String>,
    /// Bytes written to the process stdin, which is then closed. `None`
    /// attaches no stdin at all.
    pub input: Option<Vec<u8>>,
}

impl ExecRequest {
    /// Creates a request for the given command line.
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }
}

/// Outcome of a completed command.
///
/// A non-zero exit code is a normal result, not an error.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Process exit code.
    pub exit_code: i64,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ExecOutput {
    /// Returns true if the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Provider-level connection info for raw-socket protocols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Hostname or address reachable from the invoking process.
    pub host: String,
    /// Port, when the provider exposes one.
    pub port: Option<u16>,
    /// Credential or token, when the provider requires one.
    pub credentials: Option<String>,
}

/// Narrow capability interface the core consumes from a remote provider.
///
/// Implementations must be safe to share across tasks; all methods are
/// non-blocking I/O. `terminate` must be safe to call on an already
/// terminated handle.
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    /// Provider name for logs and display.
    fn name(&self) -> &'static str;

    /// Creates and starts a container for the given spec, owned by
    /// `instance_id`.
    async fn create_container(
        &self,
        instance_id: &str,
        spec: &ContainerSpec,
    ) -> Result<ContainerHandle>;

    /// Runs a command to completion inside the container.
    async fn exec(&self, handle: &ContainerHandle, request: ExecRequest) -> Result<ExecOutput>;

    /// Reads a file from the container filesystem.
    async fn read_file(&self, handle: &ContainerHandle, path: &str) -> Result<Vec<u8>>;

    /// Writes a file into the container filesystem, creating parents.
    ///
    /// All-or-nothing from the caller's perspective: on error no partial
    /// content is observable at `path`.
    async fn write_file(&self, handle: &ContainerHandle, path: &str, contents: &[u8])
        -> Result<()>;

    /// Connection info for raw-socket access, if the provider supports it
    /// for this container.
    async fn connection(&self, handle: &ContainerHandle) -> Result<Option<ConnectionInfo>>;

    /// Terminates the container. Idempotent: already-gone containers are
    /// not an error.
    async fn terminate(&self, handle: &ContainerHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_carries_ownership_metadata() {
        let handle = ContainerHandle::new("abc123", "default", "task-1");
        assert_eq!(handle.provider_id, "abc123");
        assert_eq!(handle.service, "default");
        assert_eq!(handle.instance_id, "task-1");
        // Stamped at creation; teardown logging derives uptime from it.
        assert!(handle.created_at <= Utc::now());
    }

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        let fail = ExecOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert!(ok.success());
        assert!(!fail.success());
    }

    #[test]
    fn test_provider_trait_is_object_safe() {
        fn assert_object_safe(_: &dyn ContainerProvider) {}
        let provider = MockProvider::new();
        assert_object_safe(&provider);
    }
}
