use std::time::Duration;

use async_trait::async_trait;
use overdrop_domain::UploadLink;

use crate::error::ObjStoreError;

/// Outbound timeout for the health probe.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Presigned access to tenant-scoped artifact content.
///
/// Presigned URLs use the externally reachable endpoint; direct calls
/// (delete, health) go through the internal one. The store owns every byte
/// of content; the metadata store only ever holds object keys.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Presigned GET. `filename` sets the download's
    /// `response-content-disposition`.
    async fn get_request(
        &self,
        key: &str,
        expire: Duration,
        filename: Option<&str>,
    ) -> Result<UploadLink, ObjStoreError>;

    /// Presigned PUT for the staged-upload flow.
    async fn put_request(&self, key: &str, expire: Duration)
        -> Result<UploadLink, ObjStoreError>;

    /// Presigned DELETE.
    async fn delete_request(
        &self,
        key: &str,
        expire: Duration,
    ) -> Result<UploadLink, ObjStoreError>;

    /// Direct delete. Fails with [`ObjStoreError::ObjectNotFound`] when the
    /// key does not exist; callers that only need the object gone treat
    /// that as success.
    async fn delete_object(&self, key: &str) -> Result<(), ObjStoreError>;

    /// Probe the bucket/container.
    async fn health_check(&self) -> Result<(), ObjStoreError>;
}
