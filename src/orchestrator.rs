use crate::config::SharedConfig;
use crate::error::{OrchestratorError, Result};
use crate::guest_client::GuestDialer;
use crate::hypervisor::HypervisorClient;
use crate::metrics::PhaseTimer;
use crate::network_interface::{NiPool, DEFAULT_ALLOCATE_TIMEOUT};
use crate::registry::VmRegistry;
use crate::runtime::ContainerRuntime;
use crate::vm::{Vm, VmState};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const VCPU_COUNT: u32 = 1;
const MEM_SIZE_MIB: u32 = 512;
const SETTLING_DELAY: std::time::Duration = std::time::Duration::from_millis(300);

type CleanupFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Stack of reverse-order cleanup actions, per spec §9 "Reverse-order
/// cleanup": resources acquired during `StartVM` are pushed here as they're
/// acquired; on any failure the stack unwinds LIFO. On success the stack is
/// simply dropped without running.
#[derive(Default)]
struct CleanupStack(Vec<CleanupFn>);

impl CleanupStack {
    fn new() -> Self {
        CleanupStack::default()
    }

    fn push<F, Fut>(&mut self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.0.push(Box::new(move || Box::pin(action())));
    }

    async fn unwind(mut self) {
        while let Some(action) = self.0.pop() {
            action().await;
        }
    }
}

/// Owns connections to the hypervisor control plane, container runtime, and
/// guest dialer, plus the VM registry and the network interface pool.
/// Drives each VM through the lifecycle of spec §4.3.
pub struct Orchestrator<H: HypervisorClient, R: ContainerRuntime, G: GuestDialer> {
    registry: Arc<VmRegistry>,
    ni_pool: Arc<NiPool>,
    hypervisor: Arc<H>,
    runtime: Arc<R>,
    dialer: Arc<G>,
    config: SharedConfig,
}

impl<H: HypervisorClient + 'static, R: ContainerRuntime + 'static, G: GuestDialer + 'static>
    Orchestrator<H, R, G>
{
    pub fn new(config: SharedConfig, hypervisor: Arc<H>, runtime: Arc<R>, dialer: Arc<G>) -> Self {
        let ni_pool = Arc::new(NiPool::new(config.ni_num, config.taps_per_bridge));
        Orchestrator {
            registry: Arc::new(VmRegistry::new()),
            ni_pool,
            hypervisor,
            runtime,
            dialer,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<VmRegistry> {
        &self.registry
    }

    /// Number of network interfaces currently free, for leak-detection
    /// assertions (spec §8 properties 1, 4, 6).
    pub async fn ni_available(&self) -> usize {
        self.ni_pool.available_count().await
    }

    /// `∅ → Active`. Every failure path runs the reverse-order cleanup of
    /// whatever was acquired so far and propagates the original error,
    /// per spec §7.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn start_vm(&self, vm_id: Uuid, image_name: &str) -> Result<String> {
        let mut timer = PhaseTimer::start();
        let mut cleanup = CleanupStack::new();

        let vm_handle = self.registry.allocate(vm_id).await?;
        {
            let registry = self.registry.clone();
            cleanup.push(move || async move {
                let _ = registry.free(vm_id).await;
            });
        }

        let image = match self.runtime.pull_image(image_name, &self.config.snapshotter).await {
            Ok(image) => image,
            Err(e) => {
                cleanup.unwind().await;
                return Err(OrchestratorError::ImagePullFailed(e));
            }
        };
        timer.phase("t_image");

        let ni = match self.ni_pool.allocate(DEFAULT_ALLOCATE_TIMEOUT).await {
            Ok(ni) => ni,
            Err(e) => {
                cleanup.unwind().await;
                return Err(e);
            }
        };
        {
            let ni_pool = self.ni_pool.clone();
            let ni = ni.clone();
            cleanup.push(move || async move {
                ni_pool.free(ni).await;
            });
        }

        let kernel_args = format!(
            "console=ttyS0 reboot=k panic=1 pci=off random.trust_cpu=on ip={}::{}:255.255.255.0::eth0:on",
            ni.primary_address, ni.gateway_address,
        );
        if let Err(e) = self
            .hypervisor
            .create_vm(vm_id, &kernel_args, VCPU_COUNT, MEM_SIZE_MIB, ni.primary_address)
            .await
        {
            cleanup.unwind().await;
            return Err(OrchestratorError::VmCreateFailed(e));
        }
        timer.phase("t_createVM");
        {
            let hypervisor = self.hypervisor.clone();
            cleanup.push(move || async move {
                let _ = hypervisor.stop_vm(vm_id).await;
            });
        }

        let container = match self.runtime.create_container(vm_id, &image).await {
            Ok(container) => container,
            Err(e) => {
                cleanup.unwind().await;
                return Err(OrchestratorError::ContainerFailed(e));
            }
        };
        timer.phase("t_container");
        {
            let runtime = self.runtime.clone();
            let container = container.clone();
            cleanup.push(move || async move {
                let _ = runtime.delete_container(&container).await;
            });
        }

        let task = match self.runtime.create_task(&container).await {
            Ok(task) => task,
            Err(e) => {
                cleanup.unwind().await;
                return Err(OrchestratorError::TaskFailed(e));
            }
        };
        timer.phase("t_taskCreate");

        if let Err(e) = self.runtime.start_task(&task).await {
            cleanup.unwind().await;
            return Err(OrchestratorError::TaskFailed(e));
        }
        timer.phase("t_taskStart");
        {
            let runtime = self.runtime.clone();
            let container = container.clone();
            cleanup.push(move || async move {
                let _ = runtime.delete_task(&container).await;
            });
        }

        let conn = match self.dialer.dial(ni.primary_address).await {
            Ok(client) => client,
            Err(e) => {
                cleanup.unwind().await;
                return Err(e);
            }
        };
        timer.phase("t_dial");

        {
            let mut vm = vm_handle.lock().await;
            vm.image = Some(image);
            vm.container = Some(container);
            vm.task = Some(task);
            vm.ni = Some(ni);
            vm.conn = Some(conn);
            vm.state = VmState::Active;
        }

        info!(vm_id = %vm_id, "vm started");
        Ok(timer.profile())
    }

    /// `Active|Paused → Dead`. Best-effort teardown: every step's failure
    /// is logged but never aborts the remaining steps (spec §4.3, §7
    /// `TeardownPartial`).
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn stop_single_vm(&self, vm_id: Uuid) -> Result<()> {
        let vm_handle = self.registry.get(vm_id).await?;
        let (container, _task, ni) = {
            let mut vm = vm_handle.lock().await;
            vm.state = VmState::Deactivating;
            vm.conn = None;
            (vm.container.take(), vm.task.take(), vm.ni.take())
        };
        // Dropping `_task` here stands in for "signal the root task with
        // the fatal signal" (spec §4.3) ahead of `delete_task` below.

        if let Some(container) = &container {
            if let Err(e) = self.runtime.delete_task(container).await {
                warn!(vm_id = %vm_id, error = %e, "failed to delete task during stop");
            }
            if let Err(e) = self.runtime.delete_container(container).await {
                warn!(vm_id = %vm_id, error = %e, "failed to delete container during stop");
            }
        }
        if let Err(e) = self.hypervisor.stop_vm(vm_id).await {
            warn!(vm_id = %vm_id, error = %e, "failed to stop vm during stop");
        }
        if let Some(ni) = ni {
            self.ni_pool.free(ni).await;
        }

        {
            let mut vm = vm_handle.lock().await;
            vm.state = VmState::Dead;
        }
        self.registry.free(vm_id).await?;
        debug!(vm_id = %vm_id, "vm stopped");
        Ok(())
    }

    /// Requires `Active`.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn pause_vm(&self, vm_id: Uuid) -> Result<()> {
        let vm_handle = self.registry.get(vm_id).await?;
        let mut vm = vm_handle.lock().await;
        self.require_state(&vm, VmState::Active)?;
        self.hypervisor
            .pause_vm(vm_id)
            .await
            .map_err(OrchestratorError::Internal)?;
        vm.state = VmState::Paused;
        Ok(())
    }

    /// Requires `Paused`.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn resume_vm(&self, vm_id: Uuid) -> Result<()> {
        let vm_handle = self.registry.get(vm_id).await?;
        let mut vm = vm_handle.lock().await;
        self.require_state(&vm, VmState::Paused)?;
        self.hypervisor
            .resume_vm(vm_id)
            .await
            .map_err(OrchestratorError::Internal)?;
        vm.state = VmState::Active;
        Ok(())
    }

    /// Requires `Paused`. Advances to `Snapshotted`.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn create_snapshot(&self, vm_id: Uuid) -> Result<()> {
        let vm_handle = self.registry.get(vm_id).await?;
        let mut vm = vm_handle.lock().await;
        self.require_state(&vm, VmState::Paused)?;
        let path = snapshot_path(vm_id);
        self.hypervisor
            .create_snapshot(vm_id, &path)
            .await
            .map_err(OrchestratorError::Internal)?;
        vm.snapshot_path = Some(path);
        vm.state = VmState::Snapshotted;
        Ok(())
    }

    /// Requires `Snapshotted`. Stops the live VM process/task/container,
    /// returns the NI to the pool, preserves the snapshot. Advances to
    /// `Offloaded`.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn offload(&self, vm_id: Uuid) -> Result<()> {
        let vm_handle = self.registry.get(vm_id).await?;
        let (container, ni) = {
            let mut vm = vm_handle.lock().await;
            self.require_state(&vm, VmState::Snapshotted)?;
            (vm.container.take(), vm.ni.take())
        };

        if let Some(container) = &container {
            if let Err(e) = self.runtime.delete_task(container).await {
                warn!(vm_id = %vm_id, error = %e, "failed to delete task during offload");
            }
            if let Err(e) = self.runtime.delete_container(container).await {
                warn!(vm_id = %vm_id, error = %e, "failed to delete container during offload");
            }
        }
        self.hypervisor
            .offload(vm_id)
            .await
            .map_err(OrchestratorError::Internal)?;
        if let Some(ni) = ni {
            self.ni_pool.free(ni).await;
        }

        let mut vm = vm_handle.lock().await;
        vm.task = None;
        vm.state = VmState::Offloaded;
        Ok(())
    }

    /// Requires `Offloaded`. Allocates a fresh NI, restores from snapshot,
    /// re-creates the container and task handle, dials the guest gRPC.
    /// Advances to `Paused` (the guest is not yet running until
    /// `resume_vm`).
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn load_snapshot(&self, vm_id: Uuid) -> Result<()> {
        tokio::time::sleep(SETTLING_DELAY).await;

        let vm_handle = self.registry.get(vm_id).await?;
        let (snapshot_path, image) = {
            let vm = vm_handle.lock().await;
            self.require_state(&vm, VmState::Offloaded)?;
            let snapshot_path = vm
                .snapshot_path
                .clone()
                .ok_or_else(|| OrchestratorError::Internal(anyhow::anyhow!("missing snapshot path")))?;
            let image = vm
                .image
                .clone()
                .ok_or_else(|| OrchestratorError::Internal(anyhow::anyhow!("missing image handle")))?;
            (snapshot_path, image)
        };

        let ni = self.ni_pool.allocate(DEFAULT_ALLOCATE_TIMEOUT).await?;
        if let Err(e) = self.hypervisor.load_snapshot(vm_id, &snapshot_path).await {
            self.ni_pool.free(ni).await;
            return Err(OrchestratorError::Internal(e));
        }

        let container = match self.runtime.create_container(vm_id, &image).await {
            Ok(container) => container,
            Err(e) => {
                self.ni_pool.free(ni).await;
                return Err(OrchestratorError::ContainerFailed(e));
            }
        };

        let task = match self.runtime.create_task(&container).await {
            Ok(task) => task,
            Err(e) => {
                let _ = self.runtime.delete_container(&container).await;
                self.ni_pool.free(ni).await;
                return Err(OrchestratorError::TaskFailed(e));
            }
        };
        if let Err(e) = self.runtime.start_task(&task).await {
            let _ = self.runtime.delete_container(&container).await;
            self.ni_pool.free(ni).await;
            return Err(OrchestratorError::TaskFailed(e));
        }

        let conn = match self.dialer.dial(ni.primary_address).await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = self.runtime.delete_task(&container).await;
                let _ = self.runtime.delete_container(&container).await;
                self.ni_pool.free(ni).await;
                return Err(e);
            }
        };

        let mut vm = vm_handle.lock().await;
        vm.container = Some(container);
        vm.task = Some(task);
        vm.ni = Some(ni);
        vm.conn = Some(conn);
        vm.state = VmState::Paused;
        Ok(())
    }

    /// Fan-out over every registered VM with a per-VM deadline; failures
    /// are logged but never abort the sweep (spec §5 "StopActiveVMs").
    #[instrument(skip(self))]
    pub async fn stop_all_vms(&self) {
        const PER_VM_DEADLINE: std::time::Duration = std::time::Duration::from_secs(300);
        let snapshot = self.registry.snapshot().await;
        for (vm_id, _) in snapshot {
            match tokio::time::timeout(PER_VM_DEADLINE, self.stop_single_vm(vm_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(vm_id = %vm_id, error = %e, "stop failed during sweep"),
                Err(_) => warn!(vm_id = %vm_id, "stop timed out during sweep"),
            }
        }
    }

    fn require_state(&self, vm: &Vm, expected: VmState) -> Result<()> {
        if vm.state == expected {
            Ok(())
        } else {
            Err(OrchestratorError::Internal(anyhow::anyhow!(
                "vm {} is in state {:?}, expected {:?}",
                vm.id,
                vm.state,
                expected
            )))
        }
    }
}

fn snapshot_path(vm_id: Uuid) -> String {
    format!("/var/lib/microvm-orchestrator/snapshots/{vm_id}")
}
