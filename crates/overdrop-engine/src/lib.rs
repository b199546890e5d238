pub mod abort;
pub mod assign;
pub mod catalog;
pub mod error;
pub mod planner;
pub mod status;
pub mod uploads;

mod tests;

use std::sync::Arc;
use std::time::Duration;

use overdrop_clients::{InventoryClient, WorkflowsClient};
use overdrop_domain::Tenant;
use overdrop_objstore::{ObjectStore, StoreResolver};
use overdrop_store::MetadataStore;

pub use assign::DeviceWork;
pub use catalog::{CommitUpload, NewImage};
pub use error::EngineError;
pub use uploads::UploadReaper;

/// Tunables for the deployment engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Poll-attempt ceiling per device-deployment; 0 disables the ceiling.
    pub max_attempts: u32,
    /// Page size used when resolving targets through the inventory.
    pub inventory_page_size: usize,
    /// Batch size for device-deployment inserts.
    pub insert_batch_size: usize,
    /// Validity of presigned download links handed to devices.
    pub download_expire: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_attempts: 10,
            inventory_page_size: 512,
            insert_batch_size: 512,
            download_expire: Duration::from_secs(24 * 3600),
        }
    }
}

/// The deployment engine: artifact catalog, planner, poll-time assignment,
/// status bookkeeping and the terminal sweeps. One instance serves every
/// request handler; all shared mutable state lives in the metadata store.
pub struct Engine {
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) objstore: StoreResolver,
    pub(crate) inventory: InventoryClient,
    pub(crate) workflows: WorkflowsClient,
    pub(crate) config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        objstore: StoreResolver,
        inventory: InventoryClient,
        workflows: WorkflowsClient,
        config: EngineConfig,
    ) -> Self {
        Engine {
            store,
            objstore,
            inventory,
            workflows,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// The tenant's object store: stored settings first, process defaults
    /// otherwise.
    pub(crate) async fn object_store(
        &self,
        tenant: &Tenant,
    ) -> Result<Arc<dyn ObjectStore>, EngineError> {
        let settings = self.store.get_storage_settings(tenant).await?;
        Ok(self.objstore.resolve(settings)?)
    }

    /// Readiness probe: storage reachable and the workflow runner alive.
    pub async fn healthy(&self, tenant: &Tenant) -> Result<(), EngineError> {
        self.object_store(tenant).await?.health_check().await?;
        self.workflows.health().await?;
        Ok(())
    }
}
