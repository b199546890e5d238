use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid deployment name: must be between 1 and 4096 characters")]
    InvalidDeploymentName,

    #[error("invalid artifact name: must be between 1 and 4096 characters")]
    InvalidArtifactName,

    #[error("deployment targets no devices")]
    NoTarget,

    #[error("deployment must target exactly one of: device list, all devices, group")]
    ConflictingTargets,

    #[error("artifact must declare at least one compatible device type")]
    EmptyDeviceTypes,

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("deployment log must contain at least one message")]
    EmptyLog,

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid storage settings: {0}")]
    InvalidSettings(String),
}
