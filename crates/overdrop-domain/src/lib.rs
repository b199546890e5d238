pub mod deployment;
pub mod error;
pub mod image;
pub mod settings;
pub mod types;
pub mod upload;

mod tests;

pub use deployment::{
    Deployment, DeploymentConstructor, DeploymentLog, DeploymentType, DeviceDeployment,
    LogMessage, MAX_SUBSTATE_LEN,
};
pub use error::DomainError;
pub use image::{
    depends_index, depends_overlap, depends_satisfied, ArtifactInfo, DependsTuple, Image,
    Payload, PayloadFile, Release, Tag, MAX_TAGS_PER_RELEASE, MAX_UNIQUE_TAGS_PER_TENANT,
};
pub use settings::{StorageProvider, StorageSettings};
pub use types::{
    DeploymentId, DeploymentStatus, DeviceDeploymentId, DeviceDeploymentStatus, DeviceId,
    ImageId, InstalledArtifact, Stats, Tenant,
};
pub use upload::{IntentStatus, LinkStatus, UploadIntent, UploadLink};
