//! Scriptable in-memory provider for testing.
//!
//! Behaves like a well-behaved remote provider by default: creation always
//! succeeds, exec echoes the command back, files live in a per-container
//! map. Failure modes (per-service creation failures, terminate failures,
//! reclaimed containers, slow execs) are opted into per test.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ConnectionInfo, ContainerHandle, ContainerProvider, ExecOutput, ExecRequest};
use crate::error::{Result, SandboxError};
use crate::spec::ContainerSpec;

#[derive(Debug, Default)]
struct MockContainer {
    service: String,
    files: HashMap<String, Vec<u8>>,
    gone: bool,
}

/// A mock [`ContainerProvider`] with scriptable failures.
///
/// Clones share the same container table, so a test can hand one clone to
/// the coordinator and keep another for assertions.
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    containers: Arc<Mutex<HashMap<String, MockContainer>>>,
    exec_script: Arc<Mutex<Vec<ExecOutput>>>,
    created: Arc<AtomicUsize>,
    terminated: Arc<Mutex<Vec<String>>>,
    fail_create: Vec<String>,
    fail_terminate: Vec<String>,
    exec_delay: Option<Duration>,
    connection: Option<ConnectionInfo>,
}

impl MockProvider {
    /// Creates a provider where every operation succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `create_container` fail for the named service.
    #[must_use]
    pub fn fail_creation_for(mut self, service: impl Into<String>) -> Self {
        self.fail_create.push(service.into());
        self
    }

    /// Makes `terminate` fail for the named service.
    #[must_use]
    pub fn fail_termination_for(mut self, service: impl Into<String>) -> Self {
        self.fail_terminate.push(service.into());
        self
    }

    /// Delays every exec by the given duration.
    #[must_use]
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    /// Reports the given connection info for every container.
    #[must_use]
    pub fn with_connection(mut self, info: ConnectionInfo) -> Self {
        self.connection = Some(info);
        self
    }

    /// Queues a scripted exec result, consumed in order before the default
    /// echo behavior.
    pub fn push_exec_result(&self, exit_code: i64, stdout: &str, stderr: &str) {
        self.exec_script.lock().unwrap().push(ExecOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    /// Marks a container as reclaimed by the provider.
    pub fn reclaim(&self, handle: &ContainerHandle) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(&handle.provider_id) {
            container.gone = true;
        }
    }

    /// Number of successful creations.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of containers not yet terminated or reclaimed.
    pub fn live_count(&self) -> usize {
        self.containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| !c.gone)
            .count()
    }

    /// Service names with a successful terminate attempt, in order.
    pub fn terminated_services(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }

    fn container_check(&self, handle: &ContainerHandle) -> Result<()> {
        let containers = self.containers.lock().unwrap();
        match containers.get(&handle.provider_id) {
            Some(container) if !container.gone => Ok(()),
            Some(_) => Err(SandboxError::container_gone(format!(
                "container '{}' was reclaimed",
                handle.provider_id
            ))),
            None => Err(SandboxError::container_gone(format!(
                "no such container '{}'",
                handle.provider_id
            ))),
        }
    }
}

#[async_trait]
impl ContainerProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_container(
        &self,
        instance_id: &str,
        spec: &ContainerSpec,
    ) -> Result<ContainerHandle> {
        if self.fail_create.contains(&spec.service) {
            return Err(SandboxError::exec_failure(format!(
                "simulated creation failure for '{}'",
                spec.service
            )));
        }

        let seq = self.created.fetch_add(1, Ordering::SeqCst);
        let provider_id = format!("mock-{}-{seq}", spec.service);
        self.containers.lock().unwrap().insert(
            provider_id.clone(),
            MockContainer {
                service: spec.service.clone(),
                ..MockContainer::default()
            },
        );

        Ok(ContainerHandle::new(provider_id, &spec.service, instance_id))
    }

    async fn exec(&self, handle: &ContainerHandle, request: ExecRequest) -> Result<ExecOutput> {
        if let Some(delay) = self.exec_delay {
            tokio::time::sleep(delay).await;
        }
        self.container_check(handle)?;

        let scripted = {
            let mut script = self.exec_script.lock().unwrap();
            if script.is_empty() {
                None
            } else {
                Some(script.remove(0))
            }
        };
        if let Some(output) = scripted {
            return Ok(output);
        }

        // Default behavior: with stdin, act like `cat`; otherwise echo the
        // command line back.
        let stdout = match &request.input {
            Some(input) => String::from_utf8_lossy(input).into_owned(),
            None => request.command.join(" "),
        };
        Ok(ExecOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn read_file(&self, handle: &ContainerHandle, path: &str) -> Result<Vec<u8>> {
        self.container_check(handle)?;
        let containers = self.containers.lock().unwrap();
        let container = containers
            .get(&handle.provider_id)
            .ok_or_else(|| SandboxError::container_gone(handle.provider_id.clone()))?;
        container
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::file_not_found(path))
    }

    async fn write_file(
        &self,
        handle: &ContainerHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<()> {
        self.container_check(handle)?;
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(&handle.provider_id)
            .ok_or_else(|| SandboxError::container_gone(handle.provider_id.clone()))?;
        container.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn connection(&self, handle: &ContainerHandle) -> Result<Option<ConnectionInfo>> {
        self.container_check(handle)?;
        Ok(self.connection.clone())
    }

    async fn terminate(&self, handle: &ContainerHandle) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let Some(container) = containers.get(&handle.provider_id) else {
            // Already removed: terminate is idempotent.
            return Ok(());
        };

        if self.fail_terminate.contains(&container.service) {
            return Err(SandboxError::exec_failure(format!(
                "simulated terminate failure for '{}'",
                container.service
            )));
        }

        let service = container.service.clone();
        containers.remove(&handle.provider_id);
        self.terminated.lock().unwrap().push(service);
        Ok(())
    }
}
