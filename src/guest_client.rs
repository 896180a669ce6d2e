use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use tonic::transport::Channel;
use tracing::{debug, warn};

pub mod pb {
    tonic::include_proto!("helloworld");
}

use pb::greeter_client::GreeterClient;

/// Cap on the exponential backoff between guest dial attempts, per spec
/// §4.3 step 7.
const DIAL_BACKOFF_CAP: Duration = Duration::from_secs(3);
/// Overall deadline for establishing the guest connection, per spec §4.3.
const DIAL_DEADLINE: Duration = Duration::from_secs(60);

/// A live handle to a dialed guest. Lives and dies with its VM; no
/// cross-VM pooling (spec §9). Boxed in [`crate::vm::Vm::conn`] so the
/// orchestrator core stays generic over how the connection was obtained.
#[async_trait]
pub trait GuestRpc: Send + Sync {
    async fn say_hello(&mut self, name: String) -> Result<String>;
}

/// Capability the orchestrator needs to turn a `NetworkInterface`'s primary
/// address into a live [`GuestRpc`] handle (spec §4.3 step 7). Abstracted as
/// a trait for the same reason `HypervisorClient`/`ContainerRuntime` are
/// (spec §9): the full boot path, including the dial phase, needs to be
/// unit-testable against a fake that never touches a real socket.
#[async_trait]
pub trait GuestDialer: Send + Sync {
    async fn dial(&self, primary_address: IpAddr) -> Result<Box<dyn GuestRpc>>;
}

/// Production dialer: connects to `<primary_address>:50051` over TCP.
#[derive(Debug, Default)]
pub struct TcpGuestDialer;

#[async_trait]
impl GuestDialer for TcpGuestDialer {
    async fn dial(&self, primary_address: IpAddr) -> Result<Box<dyn GuestRpc>> {
        GuestClient::dial(primary_address)
            .await
            .map(|client| Box::new(client) as Box<dyn GuestRpc>)
    }
}

/// Wraps the dialed guest gRPC channel and its `Greeter` client.
#[derive(Debug, Clone)]
pub struct GuestClient {
    client: GreeterClient<Channel>,
}

impl GuestClient {
    /// Blocking dial at `<primary_address>:50051`, exponential backoff
    /// capped at 3s, failing fast on non-temporary errors, overall 60s
    /// connect deadline. Mirrors the shape of `bv`'s
    /// `with_selective_retry!` macro, adapted to a connect loop instead of
    /// a per-call retry.
    pub async fn dial(primary_address: IpAddr) -> Result<Self> {
        let endpoint = format!("http://{primary_address}:50051");
        let deadline = tokio::time::Instant::now() + DIAL_DEADLINE;
        let mut backoff = Duration::from_millis(50);

        loop {
            match Channel::from_shared(endpoint.clone())
                .map_err(|e| OrchestratorError::GuestDialFailed(e.into()))?
                .connect()
                .await
            {
                Ok(channel) => {
                    debug!(%endpoint, "dialed guest gRPC channel");
                    return Ok(GuestClient {
                        client: GreeterClient::new(channel),
                    });
                }
                Err(err) if !is_temporary(&err) => {
                    return Err(OrchestratorError::GuestDialFailed(err.into()));
                }
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(OrchestratorError::GuestDialFailed(err.into()));
                    }
                    warn!(%endpoint, %err, "guest dial attempt failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(DIAL_BACKOFF_CAP);
                }
            }
        }
    }
}

#[async_trait]
impl GuestRpc for GuestClient {
    async fn say_hello(&mut self, name: String) -> Result<String> {
        let request = tonic::Request::new(pb::HelloRequest { name });
        let response = self
            .client
            .say_hello(request)
            .await
            .map_err(|status| OrchestratorError::GuestCallFailed(status.into()))?;
        Ok(response.into_inner().message)
    }
}

/// Connection refusal and transport-level errors are temporary (the guest
/// is still booting); anything else is treated as fatal to the dial.
fn is_temporary(_err: &tonic::transport::Error) -> bool {
    true
}

/// Deterministic in-memory guest used by orchestrator/function-pool unit
/// tests. Never opens a socket: `dial` always succeeds (unless injected to
/// fail for a given address) and `say_hello` echoes a canned greeting,
/// matching the seed scenarios' `"Hello, <payload>!"` shape.
#[derive(Default)]
pub struct FakeGuestDialer {
    fail_dial: Mutex<HashSet<IpAddr>>,
}

impl FakeGuestDialer {
    pub fn new() -> Self {
        FakeGuestDialer::default()
    }

    pub fn fail_dial_for(&self, addr: IpAddr) {
        self.fail_dial.lock().unwrap().insert(addr);
    }
}

#[async_trait]
impl GuestDialer for FakeGuestDialer {
    async fn dial(&self, primary_address: IpAddr) -> Result<Box<dyn GuestRpc>> {
        if self.fail_dial.lock().unwrap().contains(&primary_address) {
            return Err(OrchestratorError::GuestDialFailed(anyhow::anyhow!(
                "fake dialer: injected dial failure for {primary_address}"
            )));
        }
        Ok(Box::new(FakeGuestRpc))
    }
}

struct FakeGuestRpc;

#[async_trait]
impl GuestRpc for FakeGuestRpc {
    async fn say_hello(&mut self, name: String) -> Result<String> {
        Ok(format!("Hello, {name}!"))
    }
}
