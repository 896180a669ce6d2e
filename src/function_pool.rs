use crate::config::SharedConfig;
use crate::error::{OrchestratorError, Result};
use crate::function::Function;
use crate::guest_client::{GuestDialer, GuestRpc};
use crate::hypervisor::HypervisorClient;
use crate::metrics;
use crate::orchestrator::Orchestrator;
use crate::runtime::ContainerRuntime;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Result of a [`FuncPool::serve`] call: the guest's reply and whether this
/// call's own `AddInstance` fired the boot latch (spec §4.4 step 5).
pub struct ServeOutcome {
    pub reply: String,
    pub is_cold_start: bool,
}

/// `fID → Function` map, insert-only in the reference design (spec §3).
/// Generic over the same collaborators the [`Orchestrator`] is, so a single
/// fake-backed instantiation drives both in unit tests.
pub struct FuncPool<H: HypervisorClient, R: ContainerRuntime, G: GuestDialer> {
    functions: RwLock<HashMap<String, Arc<Function>>>,
    config: SharedConfig,
    orchestrator: Arc<Orchestrator<H, R, G>>,
}

impl<H: HypervisorClient + 'static, R: ContainerRuntime + 'static, G: GuestDialer + 'static>
    FuncPool<H, R, G>
{
    pub fn new(config: SharedConfig, orchestrator: Arc<Orchestrator<H, R, G>>) -> Self {
        FuncPool {
            functions: RwLock::new(HashMap::new()),
            config,
            orchestrator,
        }
    }

    /// Looks up `fID`, inserting a fresh [`Function`] on first sight.
    /// Functions are never removed for the lifetime of the process (spec §3
    /// "Lifecycles").
    pub async fn get_or_create(&self, fid: &str, image_name: &str) -> Arc<Function> {
        if let Some(function) = self.functions.read().await.get(fid) {
            return function.clone();
        }
        let mut functions = self.functions.write().await;
        functions
            .entry(fid.to_string())
            .or_insert_with(|| {
                Arc::new(Function::new(
                    fid.to_string(),
                    image_name.to_string(),
                    self.config.pinned_func_num,
                ))
            })
            .clone()
    }

    /// Drives the boot-then-forward path of spec §4.4. Concurrent callers on
    /// the same cold `fID` race to become the boot leader; the loser(s) wait
    /// on the same latch and then proceed once an instance exists.
    #[instrument(skip(self, payload), fields(fid = %fid))]
    pub async fn serve(
        self: &Arc<Self>,
        fid: &str,
        image_name: &str,
        payload: &str,
    ) -> Result<ServeOutcome> {
        let function = self.get_or_create(fid, image_name).await;
        let mut is_cold_start = false;

        loop {
            // Enable the waiter before checking, so a `rearm` that fires
            // between the check and the wait is never missed. A `Notified`
            // only enqueues itself on first poll, not on creation, so it
            // must be pinned and explicitly `enable()`d rather than just
            // held until `.await`.
            let notified = function.boot_latch().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !function.is_empty().await {
                break;
            }
            if function.boot_latch().try_become_leader() {
                is_cold_start = true;
                let result = self.add_instance(&function, image_name).await;
                function.boot_latch().rearm();
                result?;
                break;
            }
            notified.await;
        }

        let vm_id = function.current_instance().await.ok_or_else(|| {
            OrchestratorError::Internal(anyhow::anyhow!(
                "function {fid} has no instance after boot"
            ))
        })?;
        let vm_handle = self.orchestrator.registry().get(vm_id).await?;
        let reply = {
            let mut vm = vm_handle.lock().await;
            let conn = vm.conn.as_mut().ok_or_else(|| {
                OrchestratorError::Internal(anyhow::anyhow!(
                    "vm {vm_id} has no guest connection"
                ))
            })?;
            conn.say_hello(payload.to_string()).await?
        };

        if is_cold_start {
            metrics::record_cold_start();
        } else {
            metrics::record_warm_start();
        }

        let served_since_boot = function.record_served();
        if !function.is_pinned
            && self.config.served_threshold > 0
            && served_since_boot >= self.config.served_threshold
        {
            self.remove_instance(&function, false).await;
        }

        Ok(ServeOutcome {
            reply,
            is_cold_start,
        })
    }

    /// Reserves a fresh `vmID`, boots it via the orchestrator, and appends it
    /// on success. A failed `StartVM` is fatal to the caller's `Serve`; the
    /// caller re-arms the boot latch regardless of outcome (spec §4.4).
    ///
    /// The source's `vmID = fID + "_" + lastInstanceID` string scheme isn't
    /// reproduced: the Registry here is keyed by [`Uuid`], so a fresh
    /// `Uuid::new_v4()` is reserved per instance instead, which satisfies the
    /// same "no duplicate vmID" guarantee by construction.
    async fn add_instance(self: &Arc<Self>, function: &Arc<Function>, image_name: &str) -> Result<()> {
        let vm_id = Uuid::new_v4();
        self.orchestrator.start_vm(vm_id, image_name).await?;
        function.push_instance(vm_id).await;
        Ok(())
    }

    /// Dequeues the current instance and tears it down, synchronously or in
    /// the background, then re-arms the boot latch. Idempotent when the
    /// function has no instances (spec §4.4).
    #[instrument(skip(self, function), fields(fid = %function.fid))]
    pub async fn remove_instance(self: &Arc<Self>, function: &Arc<Function>, sync: bool) {
        let vm_id = match function.pop_instance().await {
            Some(id) => id,
            None => return,
        };
        function.boot_latch().rearm();

        if sync {
            if let Err(e) = self.evict(vm_id).await {
                warn!(vm_id = %vm_id, error = %e, "failed to evict instance");
            }
        } else {
            let pool = self.clone();
            tokio::spawn(async move {
                if let Err(e) = pool.evict(vm_id).await {
                    warn!(vm_id = %vm_id, error = %e, "failed to evict instance");
                }
            });
        }
    }

    /// `isSaveMemory` policy (spec §4.4): preserve the snapshot via the
    /// pause/snapshot/offload sequence, or fully tear the VM down.
    async fn evict(&self, vm_id: Uuid) -> Result<()> {
        if self.config.save_memory {
            self.orchestrator.pause_vm(vm_id).await?;
            self.orchestrator.create_snapshot(vm_id).await?;
            self.orchestrator.offload(vm_id).await?;
        } else {
            self.orchestrator.stop_single_vm(vm_id).await?;
        }
        Ok(())
    }

    pub async fn function_count(&self) -> usize {
        self.functions.read().await.len()
    }
}
