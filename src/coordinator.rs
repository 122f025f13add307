//! Instance lifecycle orchestration.
//!
//! Drives one instance through create → provision → hand out environments →
//! teardown, and guarantees a best-effort teardown pass runs exactly once
//! per instance id no matter which step failed. Configuration errors abort
//! before any container is created; partial provisioning failures tear down
//! the successes before surfacing.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config;
use crate::environment::SandboxEnvironment;
use crate::error::{ProvisionFailure, Result};
use crate::provider::ContainerProvider;
use crate::provision;
use crate::registry::{InstanceEntry, InstanceRegistry, Phase};
use crate::spec::build_specs;

/// Orchestrates provisioning and teardown for task instances.
///
/// Cheap to clone-by-construction: hold it for the process lifetime and
/// call [`launch`]/[`close`] per instance.
///
/// [`launch`]: LifecycleCoordinator::launch
/// [`close`]: LifecycleCoordinator::close
pub struct LifecycleCoordinator {
    provider: Arc<dyn ContainerProvider>,
    registry: Arc<InstanceRegistry>,
}

impl LifecycleCoordinator {
    /// Creates a coordinator backed by the process-wide registry.
    pub fn new(provider: Arc<dyn ContainerProvider>) -> Self {
        Self::with_registry(provider, InstanceRegistry::global())
    }

    /// Creates a coordinator with an explicit registry (tests).
    pub fn with_registry(
        provider: Arc<dyn ContainerProvider>,
        registry: Arc<InstanceRegistry>,
    ) -> Self {
        Self { provider, registry }
    }

    /// The registry this coordinator records into.
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Resolves configuration, provisions every declared service, and hands
    /// back one environment per service name.
    ///
    /// `config` is an optional explicit path (compose manifest or
    /// Dockerfile); otherwise `base_dir` is probed per the discovery
    /// convention. On partial provisioning failure the successes are torn
    /// down before the aggregated error is returned.
    pub async fn launch(
        &self,
        instance_id: &str,
        base_dir: &Path,
        config: Option<&Path>,
    ) -> Result<BTreeMap<String, SandboxEnvironment>> {
        // Configuration errors surface before any provisioning attempt.
        let resolved = config::resolve(instance_id, base_dir, config)?;
        let specs = build_specs(&resolved)?;
        info!(
            instance = instance_id,
            services = specs.len(),
            provider = self.provider.name(),
            "launching sandbox instance"
        );

        let entry = self.registry.register(instance_id)?;
        let _lifecycle = entry.lifecycle().lock().await;

        let outcome = provision::provision(&self.provider, &entry, &specs).await;
        entry.set_phase(Phase::Provisioned);

        if !outcome.is_complete() {
            let succeeded = outcome.handles.len();
            warn!(
                instance = instance_id,
                failed = outcome.failures.len(),
                succeeded,
                "partial provisioning failure; tearing down successes"
            );
            self.teardown_entry(&entry).await;
            return Err(ProvisionFailure {
                requested: specs.len(),
                succeeded,
                failures: outcome.failures,
            }
            .into());
        }

        let working_dirs: BTreeMap<&str, Option<String>> = specs
            .iter()
            .map(|spec| (spec.service.as_str(), spec.working_dir.clone()))
            .collect();

        let mut environments = BTreeMap::new();
        for handle in outcome.handles {
            let working_dir = working_dirs.get(handle.service.as_str()).cloned().flatten();
            environments.insert(
                handle.service.clone(),
                SandboxEnvironment::new(
                    handle,
                    working_dir,
                    Arc::clone(&self.provider),
                    entry.released_flag(),
                ),
            );
        }

        entry.set_phase(Phase::Active);
        Ok(environments)
    }

    /// Tears down every container recorded for `instance_id`.
    ///
    /// Idempotent: closing an unknown or already-closed instance is a
    /// no-op. Individual terminate failures are logged and skipped; the
    /// registry entry is always removed.
    pub async fn close(&self, instance_id: &str) -> Result<()> {
        let Some(entry) = self.registry.get(instance_id) else {
            debug!(instance = instance_id, "close: instance not registered; nothing to do");
            return Ok(());
        };

        let _lifecycle = entry.lifecycle().lock().await;
        // A racing close may have finished while we waited for the lock, and
        // the id may even have been relaunched with a fresh entry since. Only
        // tear down the exact entry we fetched.
        let still_current = self
            .registry
            .get(instance_id)
            .is_some_and(|current| Arc::ptr_eq(&entry, &current));
        if !still_current {
            debug!(instance = instance_id, "close: entry already closed; nothing to do");
            return Ok(());
        }

        self.teardown_entry(&entry).await;
        Ok(())
    }

    /// Best-effort terminate of every recorded handle; always closes the
    /// entry. Caller must hold the entry's lifecycle lock.
    async fn teardown_entry(&self, entry: &InstanceEntry) {
        let instance_id = entry.instance_id();
        entry.set_phase(Phase::TearingDown);
        entry.mark_released();

        let handles = entry.handles();
        info!(
            instance = instance_id,
            containers = handles.len(),
            "tearing down sandbox instance"
        );

        let mut failed = 0_usize;
        for handle in &handles {
            match self.provider.terminate(handle).await {
                Ok(()) => {
                    let uptime_secs = (chrono::Utc::now() - handle.created_at).num_seconds();
                    debug!(
                        instance = instance_id,
                        service = %handle.service,
                        uptime_secs,
                        "terminated container"
                    );
                }
                Err(err) => {
                    // Best effort: keep going so one stuck container cannot
                    // leak the rest.
                    failed += 1;
                    warn!(
                        instance = instance_id,
                        service = %handle.service,
                        error = %err,
                        "failed to terminate container"
                    );
                }
            }
        }
        if failed > 0 {
            warn!(
                instance = instance_id,
                failed,
                total = handles.len(),
                "teardown finished with failures"
            );
        }

        entry.set_phase(Phase::Closed);
        self.registry.remove(instance_id);
    }
}
