use overdrop_domain::DependsTuple;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    /// The uniqueness index over `(artifact name, depends tuple)` rejected
    /// an insert. Carries the offending tuple for the caller's message.
    #[error("artifact '{name}' already covers device type '{device_type}' with depends {depends:?}")]
    ArtifactConflict {
        name: String,
        device_type: String,
        depends: DependsTuple,
    },

    #[error("release cannot have more than {limit} tags")]
    TooManyTags { limit: usize },

    #[error("tenant cannot have more than {limit} distinct tags")]
    TooManyUniqueTags { limit: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
