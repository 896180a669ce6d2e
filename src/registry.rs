use crate::error::{OrchestratorError, Result};
use crate::vm::Vm;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Sole owner of every [`Vm`] record. All per-VM field mutation happens
/// under the per-VM lock the orchestrator holds; the registry-level lock
/// guards only the map itself, per spec §4.2.
#[derive(Default)]
pub struct VmRegistry {
    vms: RwLock<HashMap<Uuid, Arc<Mutex<Vm>>>>,
}

impl VmRegistry {
    pub fn new() -> Self {
        VmRegistry::default()
    }

    /// Atomically inserts a fresh [`Vm`] for `id`. Fails with
    /// `AlreadyExists` if `id` is already present; this is what makes
    /// concurrent `StartVM` calls on the same id fail fast (spec §5).
    pub async fn allocate(&self, id: Uuid) -> Result<Arc<Mutex<Vm>>> {
        let mut vms = self.vms.write().await;
        if vms.contains_key(&id) {
            return Err(OrchestratorError::AlreadyExists(id));
        }
        let handle = Arc::new(Mutex::new(Vm::allocating(id)));
        vms.insert(id, handle.clone());
        Ok(handle)
    }

    /// Looks up the per-VM handle for `id`. Fails with `NotFound` if absent.
    pub async fn get(&self, id: Uuid) -> Result<Arc<Mutex<Vm>>> {
        self.vms
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(OrchestratorError::NotFound(id))
    }

    /// Removes `id` from the registry. Fails with `NotFound` if absent.
    pub async fn free(&self, id: Uuid) -> Result<()> {
        self.vms
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(OrchestratorError::NotFound(id))
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.vms.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.vms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.vms.read().await.is_empty()
    }

    /// Returns a stable snapshot of every registered vm id and handle, used
    /// by the shutdown sweep so iteration doesn't hold the map lock while
    /// tearing down individual VMs.
    pub async fn snapshot(&self) -> Vec<(Uuid, Arc<Mutex<Vm>>)> {
        self.vms
            .read()
            .await
            .iter()
            .map(|(id, vm)| (*id, vm.clone()))
            .collect()
    }
}
