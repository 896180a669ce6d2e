pub mod control;

pub mod pb {
    tonic::include_proto!("orchestrator");
}
