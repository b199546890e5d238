use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjStoreError {
    /// The object does not exist. Delete treats this as success-shaped:
    /// callers that only need the object gone ignore it.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("invalid storage settings: {0}")]
    InvalidSettings(String),

    #[error("object store unavailable: {0}")]
    Unavailable(String),

    #[error("internal object store error: {0}")]
    Internal(String),
}
