use crate::guest_client::GuestRpc;
use crate::network_interface::NetworkInterface;
use uuid::Uuid;

/// State machine driven by the [`crate::orchestrator::Orchestrator`], per
/// spec §3/§4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Allocating,
    Active,
    Paused,
    Snapshotted,
    Offloaded,
    Deactivating,
    Dead,
}

/// Opaque handle standing in for the container runtime's `containerd.Image`.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    pub name: String,
}

/// Opaque handle standing in for `containerd.Container`.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
}

/// Opaque handle standing in for `containerd.Task`, plus the channel its
/// exit status is delivered on.
#[derive(Debug)]
pub struct TaskHandle {
    pub vm_id: Uuid,
    pub pid: u32,
    pub exit_rx: tokio::sync::oneshot::Receiver<i32>,
}

/// Mutable record owned exclusively by the [`crate::registry::VmRegistry`].
/// The Function holds only `vm_id`s and re-resolves through the registry on
/// each use (spec §9 "Cyclic/back references").
pub struct Vm {
    pub id: Uuid,
    pub image: Option<ImageHandle>,
    pub container: Option<ContainerHandle>,
    pub task: Option<TaskHandle>,
    pub ni: Option<NetworkInterface>,
    /// Dialed guest connection. `Some` only while `state == Active` or
    /// `Paused` (spec §3: conn exists only when the VM can be dialed).
    pub conn: Option<Box<dyn GuestRpc>>,
    pub snapshot_path: Option<String>,
    pub state: VmState,
}

impl Vm {
    pub fn allocating(id: Uuid) -> Self {
        Vm {
            id,
            image: None,
            container: None,
            task: None,
            ni: None,
            conn: None,
            snapshot_path: None,
            state: VmState::Allocating,
        }
    }
}
