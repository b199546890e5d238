use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overdrop_domain::{
    Deployment, DeploymentId, DeploymentLog, DeploymentStatus, DeploymentType, DeviceDeployment,
    DeviceDeploymentStatus, DeviceId, Image, ImageId, InstalledArtifact, IntentStatus, Release,
    Stats, StorageSettings, Tag, Tenant, UploadIntent,
};

use crate::error::StoreError;

// ── Query parameters ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

/// Management-API deployment search.
#[derive(Debug, Clone, Default)]
pub struct DeploymentQuery {
    /// Free text over name and artifact name.
    pub search: Option<String>,
    pub status: Option<DeploymentStatus>,
    pub deployment_type: Option<DeploymentType>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Sort by created timestamp.
    pub sort: SortOrder,
    pub skip: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageSort {
    Name,
    #[default]
    Modified,
}

#[derive(Debug, Clone, Default)]
pub struct ImageFilter {
    pub name: Option<String>,
    pub description: Option<String>,
    pub device_type: Option<String>,
    pub sort: ImageSort,
    pub order: SortOrder,
    pub page: usize,
    pub per_page: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReleaseFilter {
    pub name: Option<String>,
    pub description: Option<String>,
    pub device_type: Option<String>,
    pub tag: Option<Tag>,
    pub update_type: Option<String>,
    pub page: usize,
    pub per_page: usize,
}

/// Filter for listing a deployment's device-deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStateFilter {
    Paused,
    Active,
    Finished,
    Status(DeviceDeploymentStatus),
}

impl DeviceStateFilter {
    pub fn matches(&self, status: DeviceDeploymentStatus) -> bool {
        match self {
            DeviceStateFilter::Paused => status.is_paused(),
            DeviceStateFilter::Active => status.is_active(),
            DeviceStateFilter::Finished => status.is_terminal(),
            DeviceStateFilter::Status(s) => status == *s,
        }
    }
}

/// New state for a CAS status update.
#[derive(Debug, Clone)]
pub struct DeviceDeploymentState {
    pub status: DeviceDeploymentStatus,
    pub substate: Option<String>,
    pub finished: Option<DateTime<Utc>>,
}

// ── Expired-intent cursor ────────────────────────────────────────────────────

/// Lazy iteration over expired upload intents. The reaper must call
/// [`close`](IntentCursor::close) on every exit path; a closed cursor
/// returns `None` forever.
#[async_trait]
pub trait IntentCursor: Send {
    async fn next(&mut self) -> Result<Option<UploadIntent>, StoreError>;
    async fn close(&mut self);
}

// ── Metadata store ───────────────────────────────────────────────────────────

/// Durable records of images, deployments, device-deployments, upload
/// intents, device logs, per-tenant settings and release tags. Every
/// operation is tenant-scoped except the upload-intent scan, which feeds
/// the cross-tenant reaper.
///
/// There are no in-process locks anywhere above this trait: all
/// coordination is delegated to the conditional updates below.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    // ── Deployments ──────────────────────────────────────────────────────

    async fn insert_deployment(
        &self,
        tenant: &Tenant,
        deployment: &Deployment,
    ) -> Result<(), StoreError>;

    async fn find_deployment(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
    ) -> Result<Option<Deployment>, StoreError>;

    async fn find_unfinished_deployment(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
    ) -> Result<Option<Deployment>, StoreError>;

    /// Returns the matching page and the total match count.
    async fn find_deployments(
        &self,
        tenant: &Tenant,
        query: &DeploymentQuery,
    ) -> Result<(Vec<Deployment>, u64), StoreError>;

    /// Atomically apply `stats[from]--, stats[to]++` (increment only when
    /// `from` is `None`) and derive the lifecycle state from the result:
    /// when the counters turn terminal the same update sets
    /// `status = Finished` and stamps `finished = now`.
    async fn increment_deployment_stat(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        from: Option<DeviceDeploymentStatus>,
        to: DeviceDeploymentStatus,
        now: DateTime<Utc>,
    ) -> Result<Deployment, StoreError>;

    /// Replace the aggregate stats wholesale, deriving lifecycle state the
    /// same way as [`increment_deployment_stat`](Self::increment_deployment_stat).
    async fn set_deployment_stats(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        stats: Stats,
        now: DateTime<Utc>,
    ) -> Result<Deployment, StoreError>;

    async fn set_deployment_status(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        status: DeploymentStatus,
        finished: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn increment_deployment_device_count(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        delta: u32,
    ) -> Result<(), StoreError>;

    /// Drop a device from a pending deployment's device list, decrementing
    /// `pending` and `max_devices`. Used by decommission for newer
    /// explicit-list deployments the device never polled.
    async fn remove_pending_device(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn exists_unfinished_deployment_by_artifact(
        &self,
        tenant: &Tenant,
        artifact: ImageId,
    ) -> Result<bool, StoreError>;

    async fn exists_deployment_by_artifact(
        &self,
        tenant: &Tenant,
        artifact: ImageId,
    ) -> Result<bool, StoreError>;

    /// Active deployments created strictly after `created_after`, oldest
    /// first, paged by `skip`/`limit`.
    async fn find_newer_active_deployments(
        &self,
        tenant: &Tenant,
        created_after: DateTime<Utc>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Deployment>, StoreError>;

    // ── Device-deployments ───────────────────────────────────────────────

    async fn insert_device_deployment(
        &self,
        tenant: &Tenant,
        device_deployment: &DeviceDeployment,
    ) -> Result<(), StoreError>;

    /// Insert a batch and bump each parent deployment's device-count by the
    /// number of rows inserted for it. The bump is part of the same call so
    /// a failed batch never leaves the count behind silently.
    async fn insert_device_deployments(
        &self,
        tenant: &Tenant,
        device_deployments: &[DeviceDeployment],
    ) -> Result<(), StoreError>;

    async fn find_oldest_active_device_deployment(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceDeployment>, StoreError>;

    async fn find_latest_device_deployment(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        filter: Option<DeviceStateFilter>,
    ) -> Result<Option<DeviceDeployment>, StoreError>;

    /// List a device's slots, newest first. `active` filters on the flag;
    /// `include_deleted` controls soft-deleted rows.
    async fn find_device_deployments_for_device(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        active: Option<bool>,
        include_deleted: bool,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<DeviceDeployment>, StoreError>;

    /// Compare-and-set the status. The write happens only when the current
    /// status equals `expected`; the status observed at update time is
    /// returned either way, so the caller bumps counters exactly once and
    /// only for the transition that actually happened.
    async fn update_device_deployment_status(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
        expected: DeviceDeploymentStatus,
        state: DeviceDeploymentState,
    ) -> Result<DeviceDeploymentStatus, StoreError>;

    /// Record the assigned artifact, the poll request and the started
    /// timestamp, conditional on no image being assigned yet. A losing
    /// racer gets the winning row back unchanged.
    async fn assign_device_deployment_artifact(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
        image: ImageId,
        request: InstalledArtifact,
        now: DateTime<Utc>,
    ) -> Result<DeviceDeployment, StoreError>;

    /// Bump the attempt counter, returning the new value.
    async fn increment_device_deployment_attempts(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
    ) -> Result<u32, StoreError>;

    async fn set_device_deployment_log_availability(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
        log_available: bool,
    ) -> Result<(), StoreError>;

    /// Group the deployment's rows by status.
    async fn aggregate_device_deployment_counts(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
    ) -> Result<Stats, StoreError>;

    async fn find_device_deployments_for_deployment(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        filter: Option<DeviceStateFilter>,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<DeviceDeployment>, u64), StoreError>;

    async fn get_device_deployment(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceDeployment>, StoreError>;

    /// Set every active row of the deployment to `Aborted`. Returns the
    /// number of rows changed. Idempotent.
    async fn abort_device_deployments(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Set every active row of the device to `Decommissioned`. Returns the
    /// affected deployment ids for stat recomputation. Idempotent.
    async fn decommission_device_deployments(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeploymentId>, StoreError>;

    /// Soft-delete all of a device's rows.
    async fn delete_device_deployments_for_device(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ── Device logs ──────────────────────────────────────────────────────

    async fn save_deployment_log(
        &self,
        tenant: &Tenant,
        log: &DeploymentLog,
    ) -> Result<(), StoreError>;

    async fn get_deployment_log(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
    ) -> Result<Option<DeploymentLog>, StoreError>;

    // ── Images ───────────────────────────────────────────────────────────

    /// Insert an image. Fails with [`StoreError::ArtifactConflict`] when
    /// the uniqueness index over `(artifact name, device type, depends
    /// tuple)` rejects it; a missing depends field is a wildcard.
    async fn insert_image(&self, tenant: &Tenant, image: &Image) -> Result<(), StoreError>;

    async fn find_image(
        &self,
        tenant: &Tenant,
        id: ImageId,
    ) -> Result<Option<Image>, StoreError>;

    async fn update_image_description(
        &self,
        tenant: &Tenant,
        id: ImageId,
        description: String,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn list_images(
        &self,
        tenant: &Tenant,
        filter: &ImageFilter,
    ) -> Result<Vec<Image>, StoreError>;

    async fn delete_image(&self, tenant: &Tenant, id: ImageId) -> Result<(), StoreError>;

    /// Delete every image with the given artifact name; returns the ids of
    /// the deleted images so their objects can be reclaimed.
    async fn delete_images_by_name(
        &self,
        tenant: &Tenant,
        name: &str,
    ) -> Result<Vec<ImageId>, StoreError>;

    async fn images_by_name(
        &self,
        tenant: &Tenant,
        name: &str,
    ) -> Result<Vec<Image>, StoreError>;

    /// The smallest eligible image among `ids` compatible with the device
    /// type, or `None`.
    async fn image_by_ids_and_device_type(
        &self,
        tenant: &Tenant,
        ids: &[ImageId],
        device_type: &str,
    ) -> Result<Option<Image>, StoreError>;

    /// The smallest image with this artifact name compatible with the
    /// device type, or `None`.
    async fn image_by_name_and_device_type(
        &self,
        tenant: &Tenant,
        name: &str,
        device_type: &str,
    ) -> Result<Option<Image>, StoreError>;

    // ── Releases and tags ────────────────────────────────────────────────

    async fn list_releases(
        &self,
        tenant: &Tenant,
        filter: &ReleaseFilter,
    ) -> Result<Vec<Release>, StoreError>;

    /// Replace a release's tag set. Fails with `TooManyTags` past the
    /// per-release cap and `TooManyUniqueTags` once the tenant-wide
    /// distinct set would overflow.
    async fn replace_release_tags(
        &self,
        tenant: &Tenant,
        name: &str,
        tags: Vec<Tag>,
    ) -> Result<(), StoreError>;

    /// All distinct tags in the tenant, sorted.
    async fn list_tags(&self, tenant: &Tenant) -> Result<Vec<Tag>, StoreError>;

    /// All distinct update types across the tenant's images, sorted.
    async fn list_update_types(&self, tenant: &Tenant) -> Result<Vec<String>, StoreError>;

    async fn update_release_notes(
        &self,
        tenant: &Tenant,
        name: &str,
        notes: String,
    ) -> Result<(), StoreError>;

    async fn delete_releases_by_name(&self, tenant: &Tenant, name: &str)
        -> Result<(), StoreError>;

    // ── Upload intents ───────────────────────────────────────────────────

    async fn insert_upload_intent(&self, intent: &UploadIntent) -> Result<(), StoreError>;

    async fn get_upload_intent(
        &self,
        tenant: &Tenant,
        id: ImageId,
    ) -> Result<Option<UploadIntent>, StoreError>;

    /// Compare-and-set the intent status and refresh `updated`. Fails with
    /// [`StoreError::NotFound`] when no intent matches `(id, expected)`;
    /// the caller treats that as "changed under us" and moves on.
    async fn update_upload_intent_status(
        &self,
        tenant: &Tenant,
        id: ImageId,
        expected: IntentStatus,
        new: IntentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Cursor over intents (all tenants) whose `updated` is strictly older
    /// than `before`, oldest first.
    async fn scan_expired_upload_intents(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Box<dyn IntentCursor>, StoreError>;

    // ── Settings and limits ──────────────────────────────────────────────

    async fn get_storage_settings(
        &self,
        tenant: &Tenant,
    ) -> Result<Option<StorageSettings>, StoreError>;

    async fn set_storage_settings(
        &self,
        tenant: &Tenant,
        settings: &StorageSettings,
    ) -> Result<(), StoreError>;

    /// Scalar storage limit in bytes; `None` when the tenant has none set.
    async fn get_storage_limit(&self, tenant: &Tenant) -> Result<Option<u64>, StoreError>;

    async fn set_storage_limit(
        &self,
        tenant: &Tenant,
        limit: Option<u64>,
    ) -> Result<(), StoreError>;
}
