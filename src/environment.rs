//! Execution-facing wrapper around one provisioned container.
//!
//! A [`SandboxEnvironment`] is what the harness drives: run commands, move
//! files, grab a raw connection. It exclusively owns its container handle
//! for the lifetime of the instance; after teardown every call fails with
//! [`SandboxError::Released`], which signals a contract violation by the
//! caller rather than a transient condition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::provider::{ConnectionInfo, ContainerHandle, ContainerProvider, ExecOutput, ExecRequest};

/// Per-call options for [`SandboxEnvironment::exec`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory override; relative paths resolve against the
    /// service's working directory.
    pub cwd: Option<String>,
    /// Environment overrides for this call only.
    pub env: BTreeMap<String, String>,
    /// Bytes written to the process stdin, which is then closed.
    pub input: Option<Vec<u8>>,
    /// Requested user. Accepted syntactically but has no effect: commands
    /// always run as the container's default identity.
    pub user: Option<String>,
    /// Per-call timeout. When it elapses the caller is unblocked with a
    /// `Timeout` error; the container may still be running the command.
    pub timeout: Option<Duration>,
}

/// The stable per-service contract exposed to the harness.
pub struct SandboxEnvironment {
    service: String,
    handle: ContainerHandle,
    working_dir: String,
    provider: Arc<dyn ContainerProvider>,
    released: Arc<AtomicBool>,
}

impl std::fmt::Debug for SandboxEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEnvironment")
            .field("service", &self.service)
            .field("container", &self.handle.provider_id)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

impl SandboxEnvironment {
    pub(crate) fn new(
        handle: ContainerHandle,
        working_dir: Option<String>,
        provider: Arc<dyn ContainerProvider>,
        released: Arc<AtomicBool>,
    ) -> Self {
        Self {
            service: handle.service.clone(),
            handle,
            working_dir: working_dir.unwrap_or_else(|| "/".to_string()),
            provider,
            released,
        }
    }

    /// Service name this environment backs.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The underlying container handle.
    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(SandboxError::released(&self.service));
        }
        Ok(())
    }

    /// Resolves a path against the service working directory.
    fn resolve_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{path}", self.working_dir.trim_end_matches('/'))
        }
    }

    /// Runs a command inside the container and waits for completion.
    ///
    /// A non-zero exit code is a normal [`ExecOutput`], not an error. With
    /// `options.timeout` set, the call returns a `Timeout` error once it
    /// elapses; the in-flight remote call is abandoned, not killed.
    pub async fn exec(&self, command: Vec<String>, options: ExecOptions) -> Result<ExecOutput> {
        self.ensure_live()?;

        if let Some(user) = &options.user {
            // Documented limitation: execution always runs as the
            // container's default identity.
            debug!(service = %self.service, user = %user, "exec user option has no effect");
        }

        let workdir = match options.cwd.as_deref() {
            Some(cwd) => self.resolve_path(cwd),
            None => self.working_dir.clone(),
        };

        let request = ExecRequest {
            command,
            workdir: Some(workdir),
            env: options.env,
            input: options.input,
        };

        match options.timeout {
            Some(limit) => tokio::time::timeout(limit, self.provider.exec(&self.handle, request))
                .await
                .map_err(|_| SandboxError::timeout(limit))?,
            None => self.provider.exec(&self.handle, request).await,
        }
    }

    /// Reads a file from the container filesystem.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.ensure_live()?;
        let path = self.resolve_path(path);
        self.provider.read_file(&self.handle, &path).await
    }

    /// Writes a file into the container filesystem, creating parent
    /// directories. All-or-nothing: on failure no partial content is
    /// observable at `path`.
    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.ensure_live()?;
        let path = self.resolve_path(path);
        self.provider.write_file(&self.handle, &path, contents).await
    }

    /// Provider-level connection info for raw-socket protocols, if the
    /// provider supports it for this container.
    pub async fn connection(&self) -> Result<Option<ConnectionInfo>> {
        self.ensure_live()?;
        self.provider.connection(&self.handle).await
    }
}
