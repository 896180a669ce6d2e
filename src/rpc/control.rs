use crate::guest_client::GuestDialer;
use crate::hypervisor::HypervisorClient;
use crate::orchestrator::Orchestrator;
use crate::router::Router;
use crate::runtime::ContainerRuntime;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use super::pb::orchestrator_server::Orchestrator as OrchestratorService;
use super::pb::{
    ServeRequest, ServeResponse, StartVmRequest, StartVmResponse, StopAllVmsRequest,
    StopAllVmsResponse, StopVmRequest, StopVmResponse,
};

/// tonic service implementation, the thin layer between the wire and the
/// [`Router`] (for `Serve`, which needs admission control) and the
/// [`Orchestrator`] directly (for the primitive lifecycle ops, which spec
/// §4.5 doesn't route through the function pool at all).
pub struct ControlService<H: HypervisorClient, R: ContainerRuntime, G: GuestDialer> {
    router: Arc<Router<H, R, G>>,
    orchestrator: Arc<Orchestrator<H, R, G>>,
}

impl<H: HypervisorClient + 'static, R: ContainerRuntime + 'static, G: GuestDialer + 'static>
    ControlService<H, R, G>
{
    pub fn new(router: Arc<Router<H, R, G>>, orchestrator: Arc<Orchestrator<H, R, G>>) -> Self {
        ControlService {
            router,
            orchestrator,
        }
    }
}

#[tonic::async_trait]
impl<H: HypervisorClient + 'static, R: ContainerRuntime + 'static, G: GuestDialer + 'static>
    OrchestratorService for ControlService<H, R, G>
{
    async fn start_vm(
        &self,
        request: Request<StartVmRequest>,
    ) -> Result<Response<StartVmResponse>, Status> {
        let req = request.into_inner();
        let vm_id = Uuid::parse_str(&req.vm_id)
            .map_err(|e| Status::invalid_argument(format!("invalid vm_id: {e}")))?;
        let timing_profile = self.orchestrator.start_vm(vm_id, &req.image_name).await?;
        Ok(Response::new(StartVmResponse {
            message: format!("vm {vm_id} started"),
            timing_profile,
        }))
    }

    async fn stop_single_vm(
        &self,
        request: Request<StopVmRequest>,
    ) -> Result<Response<StopVmResponse>, Status> {
        let req = request.into_inner();
        let vm_id = Uuid::parse_str(&req.vm_id)
            .map_err(|e| Status::invalid_argument(format!("invalid vm_id: {e}")))?;
        self.orchestrator.stop_single_vm(vm_id).await?;
        Ok(Response::new(StopVmResponse {
            message: format!("vm {vm_id} stopped"),
        }))
    }

    async fn stop_all_vms(
        &self,
        _request: Request<StopAllVmsRequest>,
    ) -> Result<Response<StopAllVmsResponse>, Status> {
        self.orchestrator.stop_all_vms().await;
        Ok(Response::new(StopAllVmsResponse {
            message: "all vms stopped".to_string(),
        }))
    }

    async fn serve(
        &self,
        request: Request<ServeRequest>,
    ) -> Result<Response<ServeResponse>, Status> {
        let req = request.into_inner();
        let outcome = self
            .router
            .serve(&req.function_id, &req.image_name, &req.payload)
            .await?;
        Ok(Response::new(ServeResponse {
            payload: outcome.reply,
            is_cold_start: outcome.is_cold_start,
        }))
    }
}
