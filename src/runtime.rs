use crate::vm::{ContainerHandle, ImageHandle, TaskHandle};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

/// Capability set the orchestrator needs from the container runtime (spec
/// §6): pull, create container, create/start/delete task, delete container.
/// Task creation and start are split into two calls so the orchestrator can
/// time and report them separately, per the `t_taskCreate;t_taskStart`
/// fields of the spec §4.3 timing profile.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image_name: &str, snapshotter: &str) -> anyhow::Result<ImageHandle>;
    async fn create_container(
        &self,
        vm_id: Uuid,
        image: &ImageHandle,
    ) -> anyhow::Result<ContainerHandle>;
    async fn create_task(&self, container: &ContainerHandle) -> anyhow::Result<TaskHandle>;
    async fn start_task(&self, task: &TaskHandle) -> anyhow::Result<()>;
    async fn delete_task(&self, container: &ContainerHandle) -> anyhow::Result<()>;
    async fn delete_container(&self, container: &ContainerHandle) -> anyhow::Result<()>;
}

/// Deterministic in-memory fake for orchestrator unit tests. The image
/// cache is modelled as append-only, matching spec §5 ("concurrent pulls of
/// the same image may duplicate work, acceptable").
#[derive(Default)]
pub struct FakeContainerRuntime {
    pulled: Mutex<HashSet<String>>,
    fail_pull: Mutex<HashSet<String>>,
    fail_container: Mutex<HashSet<Uuid>>,
    fail_task_create: Mutex<HashSet<Uuid>>,
    fail_task_start: Mutex<HashSet<Uuid>>,
}

fn vm_id_of(container: &ContainerHandle) -> Uuid {
    container
        .id
        .split('-')
        .next()
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_default()
}

impl FakeContainerRuntime {
    pub fn new() -> Self {
        FakeContainerRuntime::default()
    }

    pub fn fail_pull_for(&self, image_name: &str) {
        self.fail_pull
            .lock()
            .unwrap()
            .insert(image_name.to_string());
    }

    pub fn fail_container_for(&self, vm_id: Uuid) {
        self.fail_container.lock().unwrap().insert(vm_id);
    }

    pub fn fail_task_create_for(&self, vm_id: Uuid) {
        self.fail_task_create.lock().unwrap().insert(vm_id);
    }

    pub fn fail_task_start_for(&self, vm_id: Uuid) {
        self.fail_task_start.lock().unwrap().insert(vm_id);
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn pull_image(&self, image_name: &str, _snapshotter: &str) -> anyhow::Result<ImageHandle> {
        if self.fail_pull.lock().unwrap().contains(image_name) {
            anyhow::bail!("fake runtime: injected pull failure for {image_name}");
        }
        self.pulled.lock().unwrap().insert(image_name.to_string());
        Ok(ImageHandle {
            name: image_name.to_string(),
        })
    }

    async fn create_container(
        &self,
        vm_id: Uuid,
        image: &ImageHandle,
    ) -> anyhow::Result<ContainerHandle> {
        if self.fail_container.lock().unwrap().contains(&vm_id) {
            anyhow::bail!("fake runtime: injected container create failure for {vm_id}");
        }
        Ok(ContainerHandle {
            id: format!("{vm_id}-{}", image.name),
        })
    }

    async fn create_task(&self, container: &ContainerHandle) -> anyhow::Result<TaskHandle> {
        let vm_id = vm_id_of(container);
        if self.fail_task_create.lock().unwrap().contains(&vm_id) {
            anyhow::bail!("fake runtime: injected task create failure for {vm_id}");
        }
        let (_tx, rx) = tokio::sync::oneshot::channel();
        Ok(TaskHandle {
            vm_id,
            pid: 1,
            exit_rx: rx,
        })
    }

    async fn start_task(&self, task: &TaskHandle) -> anyhow::Result<()> {
        if self.fail_task_start.lock().unwrap().contains(&task.vm_id) {
            anyhow::bail!("fake runtime: injected task start failure for {}", task.vm_id);
        }
        Ok(())
    }

    async fn delete_task(&self, _container: &ContainerHandle) -> anyhow::Result<()> {
        Ok(())
    }

    async fn delete_container(&self, _container: &ContainerHandle) -> anyhow::Result<()> {
        Ok(())
    }
}
