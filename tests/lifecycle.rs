use microvm_orchestrator::config::Config;
use microvm_orchestrator::guest_client::{FakeGuestDialer, GuestRpc};
use microvm_orchestrator::hypervisor::FakeHypervisor;
use microvm_orchestrator::orchestrator::Orchestrator;
use microvm_orchestrator::runtime::FakeContainerRuntime;
use std::sync::Arc;
use uuid::Uuid;

fn test_config() -> Arc<Config> {
    Arc::new(Config {
        snapshotter: "devmapper".to_string(),
        ni_num: 4,
        taps_per_bridge: 256,
        port: 0,
        served_threshold: 0,
        pinned_func_num: 0,
        save_memory: false,
    })
}

type TestOrchestrator = Orchestrator<FakeHypervisor, FakeContainerRuntime, FakeGuestDialer>;

fn new_orchestrator() -> (Arc<TestOrchestrator>, Arc<FakeHypervisor>, Arc<FakeContainerRuntime>) {
    let hypervisor = Arc::new(FakeHypervisor::new());
    let runtime = Arc::new(FakeContainerRuntime::new());
    let dialer = Arc::new(FakeGuestDialer::new());
    let orchestrator = Arc::new(Orchestrator::new(
        test_config(),
        hypervisor.clone(),
        runtime.clone(),
        dialer,
    ));
    (orchestrator, hypervisor, runtime)
}

// Property 1: a completed StartVM followed by StopSingleVM returns the NI
// to the pool and removes the id from the Registry.
#[tokio::test]
async fn property1_stop_releases_ni_and_registry_entry() {
    let (orchestrator, _hv, _rt) = new_orchestrator();
    let vm_id = Uuid::new_v4();

    orchestrator.start_vm(vm_id, "helloworld").await.unwrap();
    assert!(orchestrator.registry().contains(vm_id).await);
    assert_eq!(orchestrator.ni_available().await, 3);

    orchestrator.stop_single_vm(vm_id).await.unwrap();

    assert!(!orchestrator.registry().contains(vm_id).await);
    assert_eq!(orchestrator.ni_available().await, 4);
}

// Property 4: a StartVM that fails at phase k releases everything acquired
// in phases 1..k-1.
#[tokio::test]
async fn property4_failure_at_vm_create_releases_registry_and_ni() {
    let (orchestrator, hypervisor, _rt) = new_orchestrator();
    let vm_id = Uuid::new_v4();
    hypervisor.fail_create_for(vm_id);

    let err = orchestrator.start_vm(vm_id, "helloworld").await.unwrap_err();
    assert!(matches!(
        err,
        microvm_orchestrator::error::OrchestratorError::VmCreateFailed(_)
    ));

    assert!(!orchestrator.registry().contains(vm_id).await);
    assert!(!hypervisor.is_created(vm_id));
    assert_eq!(orchestrator.ni_available().await, 4, "ni must be released on vm_create failure");
}

#[tokio::test]
async fn property4_failure_at_task_create_releases_everything_acquired() {
    let (orchestrator, hypervisor, runtime) = new_orchestrator();
    let vm_id = Uuid::new_v4();
    runtime.fail_task_create_for(vm_id);

    let err = orchestrator.start_vm(vm_id, "helloworld").await.unwrap_err();
    assert!(matches!(
        err,
        microvm_orchestrator::error::OrchestratorError::TaskFailed(_)
    ));

    assert!(!orchestrator.registry().contains(vm_id).await);
    assert!(!hypervisor.is_created(vm_id), "hypervisor rollback (stop_vm) should have run");
    assert_eq!(orchestrator.ni_available().await, 4, "ni must be released on task_create failure");
}

// Property 5: a snapshot round trip yields the same guest reply as a direct
// boot, modulo the identity of the connection object itself.
#[tokio::test]
async fn property5_snapshot_round_trip_reaches_same_guest_reply() {
    let (orchestrator, _hv, _rt) = new_orchestrator();

    let direct_id = Uuid::new_v4();
    orchestrator.start_vm(direct_id, "helloworld").await.unwrap();
    let direct_reply = {
        let vm_handle = orchestrator.registry().get(direct_id).await.unwrap();
        let mut vm = vm_handle.lock().await;
        vm.conn.as_mut().unwrap().say_hello("world".to_string()).await.unwrap()
    };

    let roundtrip_id = Uuid::new_v4();
    orchestrator.start_vm(roundtrip_id, "helloworld").await.unwrap();
    orchestrator.pause_vm(roundtrip_id).await.unwrap();
    orchestrator.create_snapshot(roundtrip_id).await.unwrap();
    orchestrator.offload(roundtrip_id).await.unwrap();
    orchestrator.load_snapshot(roundtrip_id).await.unwrap();
    orchestrator.resume_vm(roundtrip_id).await.unwrap();
    let roundtrip_reply = {
        let vm_handle = orchestrator.registry().get(roundtrip_id).await.unwrap();
        let mut vm = vm_handle.lock().await;
        vm.conn.as_mut().unwrap().say_hello("world".to_string()).await.unwrap()
    };

    assert_eq!(direct_reply, roundtrip_reply);
}

// Property 6: after StopAllVMs, the Registry is empty and the NI pool is
// fully restocked.
#[tokio::test]
async fn property6_shutdown_sweep_empties_registry_and_refills_ni_pool() {
    let (orchestrator, _hv, _rt) = new_orchestrator();

    for _ in 0..4 {
        let vm_id = Uuid::new_v4();
        orchestrator.start_vm(vm_id, "helloworld").await.unwrap();
    }
    assert_eq!(orchestrator.registry().len().await, 4);

    orchestrator.stop_all_vms().await;

    assert!(orchestrator.registry().is_empty().await);
    assert_eq!(orchestrator.ni_available().await, 4);
}
