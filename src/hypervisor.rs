use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

/// Capability set the orchestrator needs from the hypervisor control plane
/// (spec §6). Abstracted as a trait, mirroring `bv::pal::Pal`'s
/// `VirtualMachine`/`create_vm` split, so the state machine can be unit
/// tested against a fake that deterministically fails at chosen phases
/// (spec §9).
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    async fn create_vm(
        &self,
        vm_id: Uuid,
        kernel_args: &str,
        vcpu_count: u32,
        mem_size_mib: u32,
        ip: std::net::IpAddr,
    ) -> anyhow::Result<()>;
    async fn stop_vm(&self, vm_id: Uuid) -> anyhow::Result<()>;
    async fn pause_vm(&self, vm_id: Uuid) -> anyhow::Result<()>;
    async fn resume_vm(&self, vm_id: Uuid) -> anyhow::Result<()>;
    async fn create_snapshot(&self, vm_id: Uuid, path: &str) -> anyhow::Result<()>;
    async fn load_snapshot(&self, vm_id: Uuid, path: &str) -> anyhow::Result<()>;
    async fn offload(&self, vm_id: Uuid) -> anyhow::Result<()>;
}

/// Deterministic in-memory fake used by orchestrator unit tests. Can be
/// configured to fail on a named operation for exactly the VM ids in
/// `fail_on`, to exercise the reverse-order cleanup paths of spec §8
/// property 4.
#[derive(Default)]
pub struct FakeHypervisor {
    created: Mutex<HashSet<Uuid>>,
    fail_create: Mutex<HashSet<Uuid>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        FakeHypervisor::default()
    }

    pub fn fail_create_for(&self, vm_id: Uuid) {
        self.fail_create.lock().unwrap().insert(vm_id);
    }

    pub fn is_created(&self, vm_id: Uuid) -> bool {
        self.created.lock().unwrap().contains(&vm_id)
    }
}

#[async_trait]
impl HypervisorClient for FakeHypervisor {
    async fn create_vm(
        &self,
        vm_id: Uuid,
        _kernel_args: &str,
        _vcpu_count: u32,
        _mem_size_mib: u32,
        _ip: std::net::IpAddr,
    ) -> anyhow::Result<()> {
        if self.fail_create.lock().unwrap().contains(&vm_id) {
            anyhow::bail!("fake hypervisor: injected create_vm failure for {vm_id}");
        }
        self.created.lock().unwrap().insert(vm_id);
        Ok(())
    }

    async fn stop_vm(&self, vm_id: Uuid) -> anyhow::Result<()> {
        self.created.lock().unwrap().remove(&vm_id);
        Ok(())
    }

    async fn pause_vm(&self, _vm_id: Uuid) -> anyhow::Result<()> {
        Ok(())
    }

    async fn resume_vm(&self, _vm_id: Uuid) -> anyhow::Result<()> {
        Ok(())
    }

    async fn create_snapshot(&self, _vm_id: Uuid, _path: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn load_snapshot(&self, _vm_id: Uuid, _path: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn offload(&self, vm_id: Uuid) -> anyhow::Result<()> {
        self.created.lock().unwrap().remove(&vm_id);
        Ok(())
    }
}
