use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overdrop_domain::{
    Deployment, DeploymentId, DeploymentLog, DeploymentStatus, DeviceDeployment,
    DeviceDeploymentId, DeviceDeploymentStatus, DeviceId, Image, ImageId, InstalledArtifact,
    IntentStatus, Release, Stats, StorageSettings, Tag, Tenant, UploadIntent,
    MAX_TAGS_PER_RELEASE, MAX_UNIQUE_TAGS_PER_TENANT,
};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::query;
use crate::store::{
    DeploymentQuery, DeviceDeploymentState, DeviceStateFilter, ImageFilter, IntentCursor,
    MetadataStore, ReleaseFilter, SortOrder,
};

#[derive(Debug, Clone, Default)]
struct ReleaseMeta {
    tags: Vec<Tag>,
    notes: String,
}

#[derive(Debug, Default)]
struct Namespace {
    images: HashMap<ImageId, Image>,
    deployments: HashMap<DeploymentId, Deployment>,
    device_deployments: HashMap<DeviceDeploymentId, DeviceDeployment>,
    logs: HashMap<(DeploymentId, DeviceId), DeploymentLog>,
    releases: HashMap<String, ReleaseMeta>,
    settings: Option<StorageSettings>,
    storage_limit: Option<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    tenants: HashMap<Tenant, Namespace>,
    /// Global, not per-tenant: the reaper scans across tenants.
    intents: HashMap<ImageId, UploadIntent>,
}

/// In-memory implementation of [`MetadataStore`].
///
/// All data is lost on process exit. Suitable for tests and ephemeral mode.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn ns(&mut self, tenant: &Tenant) -> &mut Namespace {
        self.tenants.entry(tenant.clone()).or_default()
    }

    fn ns_ref(&self, tenant: &Tenant) -> Option<&Namespace> {
        self.tenants.get(tenant)
    }
}

impl Namespace {
    fn device_deployment_mut(
        &mut self,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
    ) -> Option<&mut DeviceDeployment> {
        self.device_deployments
            .values_mut()
            .find(|dd| dd.deployment_id == deployment_id && &dd.device_id == device_id)
    }

    fn release_images(&self, name: &str) -> Vec<Image> {
        self.images
            .values()
            .filter(|i| i.name == name)
            .cloned()
            .collect()
    }

    fn build_release(&self, name: &str) -> Option<Release> {
        let images = self.release_images(name);
        let meta = self.releases.get(name).cloned().unwrap_or_default();
        Release::from_images(images, meta.tags, meta.notes)
    }
}

struct MemIntentCursor {
    items: VecDeque<UploadIntent>,
    closed: bool,
}

#[async_trait]
impl IntentCursor for MemIntentCursor {
    async fn next(&mut self) -> Result<Option<UploadIntent>, StoreError> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.items.pop_front())
    }

    async fn close(&mut self) {
        self.closed = true;
        self.items.clear();
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    // ── Deployments ──────────────────────────────────────────────────────

    async fn insert_deployment(
        &self,
        tenant: &Tenant,
        deployment: &Deployment,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let ns = inner.ns(tenant);
        if ns.deployments.contains_key(&deployment.id) {
            return Err(StoreError::InvalidInput(format!(
                "deployment {} already exists",
                deployment.id
            )));
        }
        ns.deployments.insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn find_deployment(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
    ) -> Result<Option<Deployment>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .ns_ref(tenant)
            .and_then(|ns| ns.deployments.get(&id))
            .cloned())
    }

    async fn find_unfinished_deployment(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
    ) -> Result<Option<Deployment>, StoreError> {
        Ok(self
            .find_deployment(tenant, id)
            .await?
            .filter(|d| d.finished.is_none()))
    }

    async fn find_deployments(
        &self,
        tenant: &Tenant,
        q: &DeploymentQuery,
    ) -> Result<(Vec<Deployment>, u64), StoreError> {
        let inner = self.inner.read().await;
        let mut matches: Vec<Deployment> = inner
            .ns_ref(tenant)
            .map(|ns| {
                ns.deployments
                    .values()
                    .filter(|d| query::matches_deployment_query(d, q))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        query::sort_deployments(&mut matches, q.sort);
        let total = matches.len() as u64;
        Ok((query::page(matches, q.skip, q.limit), total))
    }

    async fn increment_deployment_stat(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        from: Option<DeviceDeploymentStatus>,
        to: DeviceDeploymentStatus,
        now: DateTime<Utc>,
    ) -> Result<Deployment, StoreError> {
        let mut inner = self.inner.write().await;
        let d = inner
            .ns(tenant)
            .deployments
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        query::apply_stat_increment(d, from, to, now);
        Ok(d.clone())
    }

    async fn set_deployment_stats(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        stats: Stats,
        now: DateTime<Utc>,
    ) -> Result<Deployment, StoreError> {
        let mut inner = self.inner.write().await;
        let d = inner
            .ns(tenant)
            .deployments
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        query::apply_stats(d, stats, now);
        Ok(d.clone())
    }

    async fn set_deployment_status(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        status: DeploymentStatus,
        finished: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let d = inner
            .ns(tenant)
            .deployments
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        d.status = status;
        if let Some(ts) = finished {
            d.finished = Some(ts);
        }
        Ok(())
    }

    async fn increment_deployment_device_count(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        delta: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let d = inner
            .ns(tenant)
            .deployments
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        d.device_count += delta;
        Ok(())
    }

    async fn remove_pending_device(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let d = inner
            .ns(tenant)
            .deployments
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        let before = d.device_list.len();
        d.device_list.retain(|dev| dev != device_id);
        if d.device_list.len() < before {
            d.stats.dec(DeviceDeploymentStatus::Pending);
            d.max_devices = d.max_devices.saturating_sub(1);
            query::derive_lifecycle(d, now);
        }
        Ok(())
    }

    async fn exists_unfinished_deployment_by_artifact(
        &self,
        tenant: &Tenant,
        artifact: ImageId,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.ns_ref(tenant).is_some_and(|ns| {
            ns.deployments
                .values()
                .any(|d| d.finished.is_none() && d.artifacts.contains(&artifact))
        }))
    }

    async fn exists_deployment_by_artifact(
        &self,
        tenant: &Tenant,
        artifact: ImageId,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.ns_ref(tenant).is_some_and(|ns| {
            ns.deployments
                .values()
                .any(|d| d.artifacts.contains(&artifact))
        }))
    }

    async fn find_newer_active_deployments(
        &self,
        tenant: &Tenant,
        created_after: DateTime<Utc>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Deployment>, StoreError> {
        let inner = self.inner.read().await;
        let mut matches: Vec<Deployment> = inner
            .ns_ref(tenant)
            .map(|ns| {
                ns.deployments
                    .values()
                    .filter(|d| d.is_active() && d.created > created_after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        query::sort_deployments(&mut matches, SortOrder::Ascending);
        Ok(query::page(matches, skip, limit))
    }

    // ── Device-deployments ───────────────────────────────────────────────

    async fn insert_device_deployment(
        &self,
        tenant: &Tenant,
        dd: &DeviceDeployment,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.ns(tenant).device_deployments.insert(dd.id, dd.clone());
        Ok(())
    }

    async fn insert_device_deployments(
        &self,
        tenant: &Tenant,
        dds: &[DeviceDeployment],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let ns = inner.ns(tenant);
        let mut per_deployment: HashMap<DeploymentId, u32> = HashMap::new();
        for dd in dds {
            ns.device_deployments.insert(dd.id, dd.clone());
            *per_deployment.entry(dd.deployment_id).or_default() += 1;
        }
        for (deployment_id, count) in per_deployment {
            let d = ns
                .deployments
                .get_mut(&deployment_id)
                .ok_or(StoreError::NotFound)?;
            d.device_count += count;
        }
        Ok(())
    }

    async fn find_oldest_active_device_deployment(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceDeployment>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.ns_ref(tenant).and_then(|ns| {
            ns.device_deployments
                .values()
                .filter(|dd| {
                    &dd.device_id == device_id && dd.active && dd.deleted.is_none()
                })
                .min_by_key(|dd| dd.created)
                .cloned()
        }))
    }

    async fn find_latest_device_deployment(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        filter: Option<DeviceStateFilter>,
    ) -> Result<Option<DeviceDeployment>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.ns_ref(tenant).and_then(|ns| {
            ns.device_deployments
                .values()
                .filter(|dd| {
                    &dd.device_id == device_id
                        && dd.deleted.is_none()
                        && filter.map_or(true, |f| f.matches(dd.status))
                })
                .max_by_key(|dd| dd.created)
                .cloned()
        }))
    }

    async fn find_device_deployments_for_device(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        active: Option<bool>,
        include_deleted: bool,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<DeviceDeployment>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<DeviceDeployment> = inner
            .ns_ref(tenant)
            .map(|ns| {
                ns.device_deployments
                    .values()
                    .filter(|dd| {
                        &dd.device_id == device_id
                            && (include_deleted || dd.deleted.is_none())
                            && active.map_or(true, |a| dd.active == a)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(query::page(rows, skip, limit))
    }

    async fn update_device_deployment_status(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
        expected: DeviceDeploymentStatus,
        state: DeviceDeploymentState,
    ) -> Result<DeviceDeploymentStatus, StoreError> {
        let mut inner = self.inner.write().await;
        let dd = inner
            .ns(tenant)
            .device_deployment_mut(deployment_id, device_id)
            .ok_or(StoreError::NotFound)?;
        let observed = dd.status;
        if observed != expected {
            return Ok(observed);
        }
        dd.status = state.status;
        dd.active = state.status.is_active();
        dd.set_substate(state.substate);
        if let Some(finished) = state.finished {
            if dd.finished.is_none() {
                dd.finished = Some(finished);
            }
        }
        Ok(observed)
    }

    async fn assign_device_deployment_artifact(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
        image: ImageId,
        request: InstalledArtifact,
        now: DateTime<Utc>,
    ) -> Result<DeviceDeployment, StoreError> {
        let mut inner = self.inner.write().await;
        let dd = inner
            .ns(tenant)
            .device_deployment_mut(deployment_id, device_id)
            .ok_or(StoreError::NotFound)?;
        if dd.image.is_none() && dd.status == DeviceDeploymentStatus::Pending {
            dd.image = Some(image);
            dd.request = Some(request);
            dd.started = Some(now);
        }
        Ok(dd.clone())
    }

    async fn increment_device_deployment_attempts(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
    ) -> Result<u32, StoreError> {
        let mut inner = self.inner.write().await;
        let dd = inner
            .ns(tenant)
            .device_deployment_mut(deployment_id, device_id)
            .ok_or(StoreError::NotFound)?;
        dd.attempts += 1;
        Ok(dd.attempts)
    }

    async fn set_device_deployment_log_availability(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
        log_available: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let dd = inner
            .ns(tenant)
            .device_deployment_mut(deployment_id, device_id)
            .ok_or(StoreError::NotFound)?;
        dd.log_available = log_available;
        Ok(())
    }

    async fn aggregate_device_deployment_counts(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
    ) -> Result<Stats, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .ns_ref(tenant)
            .map(|ns| {
                query::aggregate_counts(
                    ns.device_deployments
                        .values()
                        .filter(|dd| dd.deployment_id == deployment_id),
                )
            })
            .unwrap_or_default())
    }

    async fn find_device_deployments_for_deployment(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        filter: Option<DeviceStateFilter>,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<DeviceDeployment>, u64), StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<DeviceDeployment> = inner
            .ns_ref(tenant)
            .map(|ns| {
                ns.device_deployments
                    .values()
                    .filter(|dd| {
                        dd.deployment_id == deployment_id
                            && filter.map_or(true, |f| f.matches(dd.status))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.created.cmp(&b.created));
        let total = rows.len() as u64;
        Ok((query::page(rows, skip, limit), total))
    }

    async fn get_device_deployment(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceDeployment>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.ns_ref(tenant).and_then(|ns| {
            ns.device_deployments
                .values()
                .find(|dd| dd.deployment_id == deployment_id && &dd.device_id == device_id)
                .cloned()
        }))
    }

    async fn abort_device_deployments(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let ns = inner.ns(tenant);
        let mut changed = 0;
        for dd in ns
            .device_deployments
            .values_mut()
            .filter(|dd| dd.deployment_id == deployment_id && dd.active)
        {
            dd.set_status(DeviceDeploymentStatus::Aborted, now);
            changed += 1;
        }
        Ok(changed)
    }

    async fn decommission_device_deployments(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeploymentId>, StoreError> {
        let mut inner = self.inner.write().await;
        let ns = inner.ns(tenant);
        let mut affected = BTreeSet::new();
        for dd in ns
            .device_deployments
            .values_mut()
            .filter(|dd| &dd.device_id == device_id && dd.active)
        {
            dd.set_status(DeviceDeploymentStatus::Decommissioned, now);
            affected.insert(dd.deployment_id);
        }
        Ok(affected.into_iter().collect())
    }

    async fn delete_device_deployments_for_device(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let ns = inner.ns(tenant);
        for dd in ns
            .device_deployments
            .values_mut()
            .filter(|dd| &dd.device_id == device_id && dd.deleted.is_none())
        {
            dd.deleted = Some(now);
        }
        Ok(())
    }

    // ── Device logs ──────────────────────────────────────────────────────

    async fn save_deployment_log(
        &self,
        tenant: &Tenant,
        log: &DeploymentLog,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.ns(tenant).logs.insert(
            (log.deployment_id, log.device_id.clone()),
            log.clone(),
        );
        Ok(())
    }

    async fn get_deployment_log(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
    ) -> Result<Option<DeploymentLog>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .ns_ref(tenant)
            .and_then(|ns| ns.logs.get(&(deployment_id, device_id.clone())))
            .cloned())
    }

    // ── Images ───────────────────────────────────────────────────────────

    async fn insert_image(&self, tenant: &Tenant, image: &Image) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let ns = inner.ns(tenant);
        if ns.images.contains_key(&image.id) {
            return Err(StoreError::InvalidInput(format!(
                "image {} already exists",
                image.id
            )));
        }
        for existing in ns.images.values().filter(|i| i.name == image.name) {
            if let Some((device_type, depends)) = query::image_conflict(image, existing) {
                return Err(StoreError::ArtifactConflict {
                    name: image.name.clone(),
                    device_type,
                    depends,
                });
            }
        }
        ns.images.insert(image.id, image.clone());
        Ok(())
    }

    async fn find_image(
        &self,
        tenant: &Tenant,
        id: ImageId,
    ) -> Result<Option<Image>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.ns_ref(tenant).and_then(|ns| ns.images.get(&id)).cloned())
    }

    async fn update_image_description(
        &self,
        tenant: &Tenant,
        id: ImageId,
        description: String,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let image = inner
            .ns(tenant)
            .images
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        image.description = description;
        image.modified = now;
        Ok(())
    }

    async fn list_images(
        &self,
        tenant: &Tenant,
        filter: &ImageFilter,
    ) -> Result<Vec<Image>, StoreError> {
        let inner = self.inner.read().await;
        let mut images: Vec<Image> = inner
            .ns_ref(tenant)
            .map(|ns| {
                ns.images
                    .values()
                    .filter(|i| query::matches_image_filter(i, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        query::sort_images(&mut images, filter.sort, filter.order);
        let skip = filter.page.saturating_sub(1) * filter.per_page;
        Ok(query::page(images, skip, filter.per_page))
    }

    async fn delete_image(&self, tenant: &Tenant, id: ImageId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .ns(tenant)
            .images
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn delete_images_by_name(
        &self,
        tenant: &Tenant,
        name: &str,
    ) -> Result<Vec<ImageId>, StoreError> {
        let mut inner = self.inner.write().await;
        let ns = inner.ns(tenant);
        let ids: Vec<ImageId> = ns
            .images
            .values()
            .filter(|i| i.name == name)
            .map(|i| i.id)
            .collect();
        for id in &ids {
            ns.images.remove(id);
        }
        Ok(ids)
    }

    async fn images_by_name(
        &self,
        tenant: &Tenant,
        name: &str,
    ) -> Result<Vec<Image>, StoreError> {
        let inner = self.inner.read().await;
        let mut images: Vec<Image> = inner
            .ns_ref(tenant)
            .map(|ns| ns.release_images(name))
            .unwrap_or_default();
        images.sort_by(|a, b| a.modified.cmp(&b.modified));
        Ok(images)
    }

    async fn image_by_ids_and_device_type(
        &self,
        tenant: &Tenant,
        ids: &[ImageId],
        device_type: &str,
    ) -> Result<Option<Image>, StoreError> {
        let inner = self.inner.read().await;
        let candidates: Vec<Image> = inner
            .ns_ref(tenant)
            .map(|ns| {
                ns.images
                    .values()
                    .filter(|i| ids.contains(&i.id) && i.supports_device_type(device_type))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(query::smallest(candidates))
    }

    async fn image_by_name_and_device_type(
        &self,
        tenant: &Tenant,
        name: &str,
        device_type: &str,
    ) -> Result<Option<Image>, StoreError> {
        let inner = self.inner.read().await;
        let candidates: Vec<Image> = inner
            .ns_ref(tenant)
            .map(|ns| {
                ns.images
                    .values()
                    .filter(|i| i.name == name && i.supports_device_type(device_type))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(query::smallest(candidates))
    }

    // ── Releases and tags ────────────────────────────────────────────────

    async fn list_releases(
        &self,
        tenant: &Tenant,
        filter: &ReleaseFilter,
    ) -> Result<Vec<Release>, StoreError> {
        let inner = self.inner.read().await;
        let mut releases: Vec<Release> = inner
            .ns_ref(tenant)
            .map(|ns| {
                let names: BTreeSet<&String> = ns.images.values().map(|i| &i.name).collect();
                names
                    .into_iter()
                    .filter_map(|name| ns.build_release(name))
                    .filter(|r| query::matches_release_filter(r, filter))
                    .collect()
            })
            .unwrap_or_default();
        releases.sort_by(|a, b| b.modified.cmp(&a.modified));
        let skip = filter.page.saturating_sub(1) * filter.per_page;
        Ok(query::page(releases, skip, filter.per_page))
    }

    async fn replace_release_tags(
        &self,
        tenant: &Tenant,
        name: &str,
        tags: Vec<Tag>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let ns = inner.ns(tenant);
        if !ns.images.values().any(|i| i.name == name) {
            return Err(StoreError::NotFound);
        }
        let tags: BTreeSet<Tag> = tags.into_iter().collect();
        if tags.len() > MAX_TAGS_PER_RELEASE {
            return Err(StoreError::TooManyTags {
                limit: MAX_TAGS_PER_RELEASE,
            });
        }
        let mut unique: BTreeSet<Tag> = ns
            .releases
            .iter()
            .filter(|(release, _)| release.as_str() != name)
            .flat_map(|(_, meta)| meta.tags.iter().cloned())
            .collect();
        unique.extend(tags.iter().cloned());
        if unique.len() > MAX_UNIQUE_TAGS_PER_TENANT {
            return Err(StoreError::TooManyUniqueTags {
                limit: MAX_UNIQUE_TAGS_PER_TENANT,
            });
        }
        ns.releases.entry(name.to_string()).or_default().tags = tags.into_iter().collect();
        Ok(())
    }

    async fn list_tags(&self, tenant: &Tenant) -> Result<Vec<Tag>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .ns_ref(tenant)
            .map(|ns| {
                let tags: BTreeSet<Tag> = ns
                    .releases
                    .values()
                    .flat_map(|meta| meta.tags.iter().cloned())
                    .collect();
                tags.into_iter().collect()
            })
            .unwrap_or_default())
    }

    async fn list_update_types(&self, tenant: &Tenant) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .ns_ref(tenant)
            .map(|ns| {
                let types: BTreeSet<String> = ns
                    .images
                    .values()
                    .flat_map(|i| i.updates.iter().map(|p| p.type_info.clone()))
                    .collect();
                types.into_iter().collect()
            })
            .unwrap_or_default())
    }

    async fn update_release_notes(
        &self,
        tenant: &Tenant,
        name: &str,
        notes: String,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let ns = inner.ns(tenant);
        if !ns.images.values().any(|i| i.name == name) {
            return Err(StoreError::NotFound);
        }
        ns.releases.entry(name.to_string()).or_default().notes = notes;
        Ok(())
    }

    async fn delete_releases_by_name(
        &self,
        tenant: &Tenant,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.ns(tenant).releases.remove(name);
        Ok(())
    }

    // ── Upload intents ───────────────────────────────────────────────────

    async fn insert_upload_intent(&self, intent: &UploadIntent) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.intents.contains_key(&intent.id) {
            return Err(StoreError::InvalidInput(format!(
                "upload intent {} already exists",
                intent.id
            )));
        }
        inner.intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn get_upload_intent(
        &self,
        tenant: &Tenant,
        id: ImageId,
    ) -> Result<Option<UploadIntent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .intents
            .get(&id)
            .filter(|i| &i.tenant == tenant)
            .cloned())
    }

    async fn update_upload_intent_status(
        &self,
        tenant: &Tenant,
        id: ImageId,
        expected: IntentStatus,
        new: IntentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let intent = inner
            .intents
            .get_mut(&id)
            .filter(|i| &i.tenant == tenant && i.status == expected)
            .ok_or(StoreError::NotFound)?;
        intent.status = new;
        intent.updated = now;
        Ok(())
    }

    async fn scan_expired_upload_intents(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Box<dyn IntentCursor>, StoreError> {
        let inner = self.inner.read().await;
        let mut items: Vec<UploadIntent> = inner
            .intents
            .values()
            .filter(|i| i.updated < before)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.updated.cmp(&b.updated));
        Ok(Box::new(MemIntentCursor {
            items: items.into(),
            closed: false,
        }))
    }

    // ── Settings and limits ──────────────────────────────────────────────

    async fn get_storage_settings(
        &self,
        tenant: &Tenant,
    ) -> Result<Option<StorageSettings>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.ns_ref(tenant).and_then(|ns| ns.settings.clone()))
    }

    async fn set_storage_settings(
        &self,
        tenant: &Tenant,
        settings: &StorageSettings,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.ns(tenant).settings = Some(settings.clone());
        Ok(())
    }

    async fn get_storage_limit(&self, tenant: &Tenant) -> Result<Option<u64>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.ns_ref(tenant).and_then(|ns| ns.storage_limit))
    }

    async fn set_storage_limit(
        &self,
        tenant: &Tenant,
        limit: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.ns(tenant).storage_limit = limit;
        Ok(())
    }
}
