use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy for the orchestrator core. Mirrors the table in the design
/// doc: each variant names exactly one collaborator failure mode and how it
/// propagates.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("vm {0} already exists")]
    AlreadyExists(Uuid),
    #[error("vm {0} not found")]
    NotFound(Uuid),
    #[error("no network interface available before deadline")]
    ResourceExhausted,
    #[error("image pull failed: {0:#}")]
    ImagePullFailed(#[source] anyhow::Error),
    #[error("vm create failed: {0:#}")]
    VmCreateFailed(#[source] anyhow::Error),
    #[error("container create/start failed: {0:#}")]
    ContainerFailed(#[source] anyhow::Error),
    #[error("task create/start failed: {0:#}")]
    TaskFailed(#[source] anyhow::Error),
    #[error("guest dial failed: {0:#}")]
    GuestDialFailed(#[source] anyhow::Error),
    #[error("guest call failed: {0:#}")]
    GuestCallFailed(#[source] anyhow::Error),
    #[error("orchestrator is shutting down")]
    Unavailable,
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl From<OrchestratorError> for tonic::Status {
    fn from(err: OrchestratorError) -> Self {
        use OrchestratorError::*;
        match err {
            AlreadyExists(id) => tonic::Status::already_exists(format!("vm {id} already exists")),
            NotFound(id) => tonic::Status::not_found(format!("vm {id} not found")),
            ResourceExhausted => tonic::Status::resource_exhausted(err.to_string()),
            Unavailable => tonic::Status::unavailable(err.to_string()),
            ImagePullFailed(_)
            | VmCreateFailed(_)
            | ContainerFailed(_)
            | TaskFailed(_)
            | GuestDialFailed(_) => tonic::Status::internal(err.to_string()),
            GuestCallFailed(_) => tonic::Status::aborted(err.to_string()),
            Internal(_) => tonic::Status::internal(err.to_string()),
        }
    }
}
