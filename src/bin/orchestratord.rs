use clap::Parser;
use microvm_orchestrator::config::{CmdArgs, Config};
use microvm_orchestrator::function_pool::FuncPool;
use microvm_orchestrator::guest_client::TcpGuestDialer;
use microvm_orchestrator::hypervisor::FakeHypervisor;
use microvm_orchestrator::orchestrator::Orchestrator;
use microvm_orchestrator::router::Router;
use microvm_orchestrator::rpc::control::ControlService;
use microvm_orchestrator::rpc::pb::orchestrator_server::OrchestratorServer;
use microvm_orchestrator::runtime::FakeContainerRuntime;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info, warn};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() {
    let args = CmdArgs::parse();
    let config = Arc::new(Config::from(args));

    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    // The hypervisor control plane and container runtime are out-of-scope
    // external collaborators (spec §1); this binary wires in the
    // deterministic fakes used by the test suite as a placeholder until a
    // real Firecracker/containerd adapter is substituted behind the same
    // traits. Guest dialing is genuinely ours, so it uses the real dialer.
    warn!("hypervisor and container runtime collaborators are stubbed; wire in real adapters before production use");
    let hypervisor = Arc::new(FakeHypervisor::new());
    let runtime = Arc::new(FakeContainerRuntime::new());
    let dialer = Arc::new(TcpGuestDialer);

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        hypervisor,
        runtime,
        dialer,
    ));
    let pool = Arc::new(FuncPool::new(config.clone(), orchestrator.clone()));
    let router = Arc::new(Router::new(pool));
    let control_service = ControlService::new(router.clone(), orchestrator.clone());

    let addr = ([0, 0, 0, 0], config.port).into();
    info!(%addr, "starting control RPC server");

    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl-c handler");
            return;
        }
        info!("shutdown signal received, draining");
        router.begin_shutdown();
        orchestrator.stop_all_vms().await;
        info!("drain complete");
    };

    if let Err(e) = Server::builder()
        .add_service(OrchestratorServer::new(control_service))
        .serve_with_shutdown(addr, shutdown)
        .await
    {
        error!(error = %e, "control RPC server exited with error");
        std::process::exit(1);
    }
}
