pub mod error;
pub mod inventory;
pub mod workflows;

pub use error::ClientError;
pub use inventory::{DevicePage, InventoryClient};
pub use workflows::{GenerateArtifactArgs, WorkflowsClient};
