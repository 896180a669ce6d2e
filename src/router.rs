use crate::error::{OrchestratorError, Result};
use crate::function_pool::{FuncPool, ServeOutcome};
use crate::guest_client::GuestDialer;
use crate::hypervisor::HypervisorClient;
use crate::runtime::ContainerRuntime;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default per-`Serve` deadline, matching the guest dial's own overall
/// timeout (spec §4.3/§5).
const DEFAULT_SERVE_DEADLINE: Duration = Duration::from_secs(60);

/// The narrow path between the external RPC and the [`FuncPool`] (spec
/// §4.5). Its only algorithmic contract is admission control: reject
/// `Serve` once shutdown has been signalled, attach a deadline, and let
/// cancellation propagate into the boot wait and the guest RPC via the
/// `tokio::time::timeout` future's drop.
pub struct Router<H: HypervisorClient, R: ContainerRuntime, G: GuestDialer> {
    pool: Arc<FuncPool<H, R, G>>,
    shutting_down: AtomicBool,
}

impl<H: HypervisorClient + 'static, R: ContainerRuntime + 'static, G: GuestDialer + 'static>
    Router<H, R, G>
{
    pub fn new(pool: Arc<FuncPool<H, R, G>>) -> Self {
        Router {
            pool,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<FuncPool<H, R, G>> {
        &self.pool
    }

    /// Flips the shutdown flag; every `Serve` admitted afterwards fails
    /// fast with `Unavailable` (spec §9 "Graceful shutdown").
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn serve(
        self: &Arc<Self>,
        fid: &str,
        image_name: &str,
        payload: &str,
    ) -> Result<ServeOutcome> {
        if self.is_shutting_down() {
            return Err(OrchestratorError::Unavailable);
        }

        tokio::time::timeout(
            DEFAULT_SERVE_DEADLINE,
            self.pool.serve(fid, image_name, payload),
        )
        .await
        .map_err(|_| OrchestratorError::Unavailable)?
    }
}
