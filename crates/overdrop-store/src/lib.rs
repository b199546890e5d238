pub mod error;
pub mod memory;
pub mod query;
pub mod redb_store;
pub mod store;


pub use error::StoreError;
pub use memory::InMemoryStore;
pub use redb_store::RedbStore;
pub use store::{
    DeploymentQuery, DeviceDeploymentState, DeviceStateFilter, ImageFilter, ImageSort,
    IntentCursor, MetadataStore, ReleaseFilter, SortOrder,
};
