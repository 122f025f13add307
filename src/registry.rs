//! Process-wide bookkeeping of instance ids and the containers they own.
//!
//! Every successfully created container is recorded here immediately, so a
//! crash mid-provisioning still leaves enough state for eventual cleanup.
//! Each instance gets its own entry with its own lifecycle lock; unrelated
//! instances never serialize against each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Result, SandboxError};
use crate::provider::ContainerHandle;

/// Lifecycle phase of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Entry registered, no creation attempts yet.
    Created,
    /// Every requested spec has had a creation attempt.
    Provisioned,
    /// Environments handed to the harness.
    Active,
    /// Terminate attempts in progress.
    TearingDown,
    /// Registry entry removed; terminal.
    Closed,
}

#[derive(Debug)]
struct EntryState {
    phase: Phase,
    handles: Vec<ContainerHandle>,
}

/// Bookkeeping entry for one instance id.
///
/// The `lifecycle` mutex serializes provisioning against teardown for this
/// instance; the inner state mutex is only held for short, non-awaiting
/// critical sections.
#[derive(Debug)]
pub struct InstanceEntry {
    instance_id: String,
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<EntryState>,
    released: Arc<AtomicBool>,
}

impl InstanceEntry {
    fn new(instance_id: String) -> Self {
        Self {
            instance_id,
            lifecycle: tokio::sync::Mutex::new(()),
            state: Mutex::new(EntryState {
                phase: Phase::Created,
                handles: Vec::new(),
            }),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Instance id this entry belongs to.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The per-instance lifecycle lock. Provisioning and teardown each hold
    /// it for their whole critical section.
    pub(crate) fn lifecycle(&self) -> &tokio::sync::Mutex<()> {
        &self.lifecycle
    }

    /// Records a successfully created handle.
    pub fn record_handle(&self, handle: ContainerHandle) {
        let mut state = self.state.lock().unwrap();
        state.handles.push(handle);
    }

    /// Snapshot of the handles recorded so far, in creation-record order.
    pub fn handles(&self) -> Vec<ContainerHandle> {
        self.state.lock().unwrap().handles.clone()
    }

    /// Number of handles recorded.
    pub fn handle_count(&self) -> usize {
        self.state.lock().unwrap().handles.len()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.state.lock().unwrap().phase
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.state.lock().unwrap().phase = phase;
    }

    /// Shared flag flipped at teardown; environments check it on every call.
    pub(crate) fn released_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }

    /// Marks every environment of this instance as released.
    pub(crate) fn mark_released(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Process-wide table of instance id to owned container handles.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: Mutex<HashMap<String, Arc<InstanceEntry>>>,
}

static GLOBAL: OnceLock<Arc<InstanceRegistry>> = OnceLock::new();

impl InstanceRegistry {
    /// Creates an empty registry (tests; production uses [`global`]).
    ///
    /// [`global`]: InstanceRegistry::global
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Registers a new instance id, failing if it is already live.
    pub fn register(&self, instance_id: &str) -> Result<Arc<InstanceEntry>> {
        let mut instances = self.instances.lock().unwrap();
        if instances.contains_key(instance_id) {
            return Err(SandboxError::instance_active(instance_id));
        }
        let entry = Arc::new(InstanceEntry::new(instance_id.to_string()));
        instances.insert(instance_id.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Looks up a live instance entry.
    pub fn get(&self, instance_id: &str) -> Option<Arc<InstanceEntry>> {
        self.instances.lock().unwrap().get(instance_id).cloned()
    }

    /// Removes an instance entry after teardown. Removing an absent entry
    /// is a no-op.
    pub fn remove(&self, instance_id: &str) {
        self.instances.lock().unwrap().remove(instance_id);
    }

    /// Number of handles currently recorded for an instance (0 if unknown).
    pub fn handle_count(&self, instance_id: &str) -> usize {
        self.get(instance_id)
            .map_or(0, |entry| entry.handle_count())
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = InstanceRegistry::new();
        let entry = registry.register("task-1").unwrap();
        assert_eq!(entry.instance_id(), "task-1");
        assert_eq!(entry.phase(), Phase::Created);
        assert!(registry.get("task-1").is_some());
        assert!(registry.get("task-2").is_none());
    }

    #[test]
    fn test_double_register_rejected() {
        let registry = InstanceRegistry::new();
        registry.register("task-1").unwrap();
        let err = registry.register("task-1").unwrap_err();
        assert!(matches!(err, SandboxError::InstanceActive { .. }));
    }

    #[test]
    fn test_register_again_after_remove() {
        let registry = InstanceRegistry::new();
        registry.register("task-1").unwrap();
        registry.remove("task-1");
        assert!(registry.register("task-1").is_ok());
    }

    #[test]
    fn test_handles_recorded_in_order() {
        let registry = InstanceRegistry::new();
        let entry = registry.register("task-1").unwrap();
        entry.record_handle(ContainerHandle::new("c1", "first", "task-1"));
        entry.record_handle(ContainerHandle::new("c2", "second", "task-1"));

        let handles = entry.handles();
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].service, "first");
        assert_eq!(handles[1].service, "second");
        assert_eq!(registry.handle_count("task-1"), 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = InstanceRegistry::new();
        registry.register("task-1").unwrap();
        registry.remove("task-1");
        registry.remove("task-1");
        assert_eq!(registry.instance_count(), 0);
    }

    #[test]
    fn test_released_flag_shared() {
        let registry = InstanceRegistry::new();
        let entry = registry.register("task-1").unwrap();
        let flag = entry.released_flag();
        assert!(!flag.load(Ordering::SeqCst));
        entry.mark_released();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_global_registry_is_shared() {
        let a = InstanceRegistry::global();
        let b = InstanceRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
