use overdrop_clients::ClientError;
use overdrop_domain::DomainError;
use overdrop_objstore::ObjStoreError;
use overdrop_store::StoreError;
use thiserror::Error;

/// The surface-visible error taxonomy. Internal causes are carried for
/// logging but the API layer shows callers a sanitised message.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// Zero devices resolved for a deployment target.
    #[error("no devices matched the deployment target")]
    NoDevices,

    #[error("upstream service unavailable: {0}")]
    Upstream(String),

    /// The surrounding context was cancelled; background loops surface the
    /// cause to their caller.
    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => EngineError::NotFound,
            conflict @ (StoreError::ArtifactConflict { .. }
            | StoreError::TooManyTags { .. }
            | StoreError::TooManyUniqueTags { .. }) => {
                EngineError::Conflict(conflict.to_string())
            }
            StoreError::InvalidInput(msg) => EngineError::InvalidInput(msg),
            StoreError::Serialization(e) => EngineError::Internal(e.to_string()),
            StoreError::Internal(msg) => EngineError::Internal(msg),
        }
    }
}

impl From<ObjStoreError> for EngineError {
    fn from(e: ObjStoreError) -> Self {
        match e {
            ObjStoreError::ObjectNotFound(_) => EngineError::NotFound,
            ObjStoreError::InvalidSettings(msg) => EngineError::Internal(msg),
            ObjStoreError::Unavailable(msg) => EngineError::Upstream(msg),
            ObjStoreError::Internal(msg) => EngineError::Internal(msg),
        }
    }
}

impl From<ClientError> for EngineError {
    fn from(e: ClientError) -> Self {
        EngineError::Upstream(e.to_string())
    }
}

impl From<DomainError> for EngineError {
    fn from(e: DomainError) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}
