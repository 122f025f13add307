//! Fan-out container provisioning.
//!
//! Independent services are created concurrently with a single join point.
//! Every successful creation is recorded in the instance entry immediately,
//! not after the batch completes, so a crash mid-batch still leaves enough
//! bookkeeping for cleanup. A failed service never discards the handles of
//! services that succeeded.

use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ServiceFailure;
use crate::provider::{ContainerHandle, ContainerProvider};
use crate::registry::InstanceEntry;
use crate::spec::ContainerSpec;

/// Result of one provisioning pass: handles for the services that came up,
/// detail for the ones that did not.
#[derive(Debug)]
pub struct ProvisionOutcome {
    /// Successfully created handles in manifest order.
    pub handles: Vec<ContainerHandle>,
    /// Per-service failures in manifest order.
    pub failures: Vec<ServiceFailure>,
}

impl ProvisionOutcome {
    /// True when every requested service provisioned.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Creates one container per spec, concurrently.
pub async fn provision(
    provider: &Arc<dyn ContainerProvider>,
    entry: &InstanceEntry,
    specs: &[ContainerSpec],
) -> ProvisionOutcome {
    let instance_id = entry.instance_id();

    let attempts = specs.iter().map(|spec| {
        let provider = Arc::clone(provider);
        async move {
            debug!(instance = instance_id, service = %spec.service, "creating container");
            let result = provider.create_container(instance_id, spec).await;
            if let Ok(handle) = &result {
                // Record before the join point so a failure elsewhere in
                // the batch cannot leak this container.
                entry.record_handle(handle.clone());
            }
            (spec.service.clone(), result)
        }
    });

    let mut handles = Vec::with_capacity(specs.len());
    let mut failures = Vec::new();
    for (service, result) in join_all(attempts).await {
        match result {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                warn!(instance = instance_id, service = %service, error = %err, "container creation failed");
                failures.push(ServiceFailure {
                    service,
                    message: err.to_string(),
                });
            }
        }
    }

    ProvisionOutcome { handles, failures }
}
