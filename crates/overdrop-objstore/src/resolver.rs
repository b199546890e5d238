use std::sync::Arc;

use overdrop_domain::{StorageProvider, StorageSettings};

use crate::azure::AzureBlobStore;
use crate::error::ObjStoreError;
use crate::s3::S3Store;
use crate::store::ObjectStore;

/// Builds the right [`ObjectStore`] for a tenant: its own stored settings
/// when present, the process-wide defaults otherwise.
#[derive(Clone, Default)]
pub struct StoreResolver {
    defaults: Option<StorageSettings>,
}

impl StoreResolver {
    pub fn new(defaults: Option<StorageSettings>) -> Self {
        StoreResolver { defaults }
    }

    pub fn resolve(
        &self,
        tenant_settings: Option<StorageSettings>,
    ) -> Result<Arc<dyn ObjectStore>, ObjStoreError> {
        let settings = tenant_settings
            .or_else(|| self.defaults.clone())
            .ok_or_else(|| {
                ObjStoreError::InvalidSettings(
                    "no storage settings for tenant and no defaults configured".into(),
                )
            })?;
        match settings.provider {
            StorageProvider::S3 => Ok(Arc::new(S3Store::from_settings(&settings)?)),
            StorageProvider::Azure => Ok(Arc::new(AzureBlobStore::from_settings(&settings)?)),
        }
    }
}
