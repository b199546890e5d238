use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overdrop_domain::{
    Deployment, DeploymentId, DeploymentLog, DeploymentStatus, DeviceDeployment,
    DeviceDeploymentStatus, DeviceId, Image, ImageId, InstalledArtifact, IntentStatus, Release,
    Stats, StorageSettings, Tag, Tenant, UploadIntent, MAX_TAGS_PER_RELEASE,
    MAX_UNIQUE_TAGS_PER_TENANT,
};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::query;
use crate::store::{
    DeploymentQuery, DeviceDeploymentState, DeviceStateFilter, ImageFilter, IntentCursor,
    MetadataStore, ReleaseFilter, SortOrder,
};

const IMAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("images");
const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");
const DEVICE_DEPLOYMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("device_deployments");
const DEVICE_LOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("device_logs");
const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");
const INTENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("upload_intents");
const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");
const LIMITS: TableDefinition<&str, u64> = TableDefinition::new("limits");

/// Key separator. Tenant ids never contain control characters, so
/// `{tenant}\x1f{id}` sorts all of a tenant's rows into one contiguous
/// range.
const SEP: char = '\x1f';

fn key(tenant: &Tenant, id: &str) -> String {
    format!("{}{}{}", tenant.as_str(), SEP, id)
}

/// Range covering every key of one tenant.
fn tenant_range(tenant: &Tenant) -> (String, String) {
    (
        format!("{}{}", tenant.as_str(), SEP),
        format!("{}\x20", tenant.as_str()),
    )
}

fn internal<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Internal(e.to_string())
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct ReleaseMeta {
    tags: Vec<Tag>,
    notes: String,
}

/// Persistent metadata store backed by a redb database file.
///
/// redb has a single writer: every conditional update runs inside one write
/// transaction, which is what makes the CAS operations atomic.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a redb database at `path`.
    ///
    /// Parent directories are created automatically.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(internal)?;
        }
        let db = Database::create(path).map_err(internal)?;

        // Ensure tables exist
        {
            let wtxn = db.begin_write().map_err(internal)?;
            wtxn.open_table(IMAGES).map_err(internal)?;
            wtxn.open_table(DEPLOYMENTS).map_err(internal)?;
            wtxn.open_table(DEVICE_DEPLOYMENTS).map_err(internal)?;
            wtxn.open_table(DEVICE_LOGS).map_err(internal)?;
            wtxn.open_table(RELEASES).map_err(internal)?;
            wtxn.open_table(INTENTS).map_err(internal)?;
            wtxn.open_table(SETTINGS).map_err(internal)?;
            wtxn.open_table(LIMITS).map_err(internal)?;
            wtxn.commit().map_err(internal)?;
        }

        Ok(Self { db: Arc::new(db) })
    }

    /// Read one document.
    fn get_doc<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(table).map_err(internal)?;
        match table.get(key).map_err(internal)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Read every document of one tenant from a table.
    fn scan_tenant<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        tenant: &Tenant,
    ) -> Result<Vec<T>, StoreError> {
        let (start, end) = tenant_range(tenant);
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(table).map_err(internal)?;
        let mut out = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(internal)?
        {
            let (_k, v) = entry.map_err(internal)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    /// Write one document inside its own transaction.
    fn put_doc<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        doc: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(doc)?;
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(table).map_err(internal)?;
            table.insert(key, bytes.as_slice()).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    /// Load-modify-store one deployment in a single write transaction.
    fn with_deployment<R>(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        f: impl FnOnce(&mut Deployment) -> R,
    ) -> Result<R, StoreError> {
        let k = key(tenant, &id.to_string());
        let wtxn = self.db.begin_write().map_err(internal)?;
        let result = {
            let mut table = wtxn.open_table(DEPLOYMENTS).map_err(internal)?;
            let mut deployment: Deployment = match table.get(k.as_str()).map_err(internal)? {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => return Err(StoreError::NotFound),
            };
            let result = f(&mut deployment);
            let bytes = serde_json::to_vec(&deployment)?;
            table.insert(k.as_str(), bytes.as_slice()).map_err(internal)?;
            result
        };
        wtxn.commit().map_err(internal)?;
        Ok(result)
    }

    /// Load-modify-store every device-deployment of a tenant that `pick`
    /// selects, in a single write transaction. `f` may decline the write by
    /// returning false.
    fn with_device_deployments<R>(
        &self,
        tenant: &Tenant,
        pick: impl Fn(&DeviceDeployment) -> bool,
        mut f: impl FnMut(&mut DeviceDeployment) -> bool,
        finish: impl FnOnce(&[DeviceDeployment]) -> R,
    ) -> Result<R, StoreError> {
        let (start, end) = tenant_range(tenant);
        let wtxn = self.db.begin_write().map_err(internal)?;
        let result = {
            let mut table = wtxn.open_table(DEVICE_DEPLOYMENTS).map_err(internal)?;
            let mut picked: Vec<(String, DeviceDeployment)> = Vec::new();
            for entry in table
                .range(start.as_str()..end.as_str())
                .map_err(internal)?
            {
                let (k, v) = entry.map_err(internal)?;
                let dd: DeviceDeployment = serde_json::from_slice(v.value())?;
                if pick(&dd) {
                    picked.push((k.value().to_string(), dd));
                }
            }
            let mut touched = Vec::new();
            for (k, mut dd) in picked {
                if f(&mut dd) {
                    let bytes = serde_json::to_vec(&dd)?;
                    table.insert(k.as_str(), bytes.as_slice()).map_err(internal)?;
                    touched.push(dd);
                }
            }
            finish(&touched)
        };
        wtxn.commit().map_err(internal)?;
        Ok(result)
    }
}

struct RedbIntentCursor {
    items: VecDeque<UploadIntent>,
    closed: bool,
}

#[async_trait]
impl IntentCursor for RedbIntentCursor {
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
impl MetadataStore for RedbStore {
    // ── Deployments ──────────────────────────────────────────────────────

    async fn insert_deployment(
        &self,
        tenant: &Tenant,
        deployment: &Deployment,
    ) -> Result<(), StoreError> {
        let k = key(tenant, &deployment.id.to_string());
        if self
            .get_doc::<Deployment>(DEPLOYMENTS, &k)?
            .is_some()
        {
            return Err(StoreError::InvalidInput(format!(
                "deployment {} already exists",
                deployment.id
            )));
        }
        self.put_doc(DEPLOYMENTS, &k, deployment)
    }

    async fn find_deployment(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
    ) -> Result<Option<Deployment>, StoreError> {
        self.get_doc(DEPLOYMENTS, &key(tenant, &id.to_string()))
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
        let mut matches: Vec<Deployment> = self
            .scan_tenant::<Deployment>(DEPLOYMENTS, tenant)?
            .into_iter()
            .filter(|d| query::matches_deployment_query(d, q))
            .collect();
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
        self.with_deployment(tenant, id, |d| {
            query::apply_stat_increment(d, from, to, now);
            d.clone()
        })
    }

    async fn set_deployment_stats(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        stats: Stats,
        now: DateTime<Utc>,
    ) -> Result<Deployment, StoreError> {
        self.with_deployment(tenant, id, |d| {
            query::apply_stats(d, stats, now);
            d.clone()
        })
    }

    async fn set_deployment_status(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        status: DeploymentStatus,
        finished: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.with_deployment(tenant, id, |d| {
            d.status = status;
            if let Some(ts) = finished {
                d.finished = Some(ts);
            }
        })
    }

    async fn increment_deployment_device_count(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        delta: u32,
    ) -> Result<(), StoreError> {
        self.with_deployment(tenant, id, |d| {
            d.device_count += delta;
        })
    }

    async fn remove_pending_device(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_deployment(tenant, id, |d| {
            let before = d.device_list.len();
            d.device_list.retain(|dev| dev != device_id);
            if d.device_list.len() < before {
                d.stats.dec(DeviceDeploymentStatus::Pending);
                d.max_devices = d.max_devices.saturating_sub(1);
                query::derive_lifecycle(d, now);
            }
        })
    }

    async fn exists_unfinished_deployment_by_artifact(
        &self,
        tenant: &Tenant,
        artifact: ImageId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .scan_tenant::<Deployment>(DEPLOYMENTS, tenant)?
            .iter()
            .any(|d| d.finished.is_none() && d.artifacts.contains(&artifact)))
    }

    async fn exists_deployment_by_artifact(
        &self,
        tenant: &Tenant,
        artifact: ImageId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .scan_tenant::<Deployment>(DEPLOYMENTS, tenant)?
            .iter()
            .any(|d| d.artifacts.contains(&artifact)))
    }

    async fn find_newer_active_deployments(
        &self,
        tenant: &Tenant,
        created_after: DateTime<Utc>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Deployment>, StoreError> {
        let mut matches: Vec<Deployment> = self
            .scan_tenant::<Deployment>(DEPLOYMENTS, tenant)?
            .into_iter()
            .filter(|d| d.is_active() && d.created > created_after)
            .collect();
        query::sort_deployments(&mut matches, SortOrder::Ascending);
        Ok(query::page(matches, skip, limit))
    }

    // ── Device-deployments ───────────────────────────────────────────────

    async fn insert_device_deployment(
        &self,
        tenant: &Tenant,
        dd: &DeviceDeployment,
    ) -> Result<(), StoreError> {
        self.put_doc(DEVICE_DEPLOYMENTS, &key(tenant, &dd.id.to_string()), dd)
    }

    async fn insert_device_deployments(
        &self,
        tenant: &Tenant,
        dds: &[DeviceDeployment],
    ) -> Result<(), StoreError> {
        // One transaction: either the whole batch and its count bumps land,
        // or none of it does.
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(DEVICE_DEPLOYMENTS).map_err(internal)?;
            let mut per_deployment: HashMap<DeploymentId, u32> = HashMap::new();
            for dd in dds {
                let bytes = serde_json::to_vec(dd)?;
                table
                    .insert(key(tenant, &dd.id.to_string()).as_str(), bytes.as_slice())
                    .map_err(internal)?;
                *per_deployment.entry(dd.deployment_id).or_default() += 1;
            }
            let mut deployments = wtxn.open_table(DEPLOYMENTS).map_err(internal)?;
            for (deployment_id, count) in per_deployment {
                let k = key(tenant, &deployment_id.to_string());
                let mut deployment: Deployment =
                    match deployments.get(k.as_str()).map_err(internal)? {
                        Some(guard) => serde_json::from_slice(guard.value())?,
                        None => return Err(StoreError::NotFound),
                    };
                deployment.device_count += count;
                let bytes = serde_json::to_vec(&deployment)?;
                deployments
                    .insert(k.as_str(), bytes.as_slice())
                    .map_err(internal)?;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn find_oldest_active_device_deployment(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceDeployment>, StoreError> {
        Ok(self
            .scan_tenant::<DeviceDeployment>(DEVICE_DEPLOYMENTS, tenant)?
            .into_iter()
            .filter(|dd| &dd.device_id == device_id && dd.active && dd.deleted.is_none())
            .min_by_key(|dd| dd.created))
    }

    async fn find_latest_device_deployment(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        filter: Option<DeviceStateFilter>,
    ) -> Result<Option<DeviceDeployment>, StoreError> {
        Ok(self
            .scan_tenant::<DeviceDeployment>(DEVICE_DEPLOYMENTS, tenant)?
            .into_iter()
            .filter(|dd| {
                &dd.device_id == device_id
                    && dd.deleted.is_none()
                    && filter.map_or(true, |f| f.matches(dd.status))
            })
            .max_by_key(|dd| dd.created))
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
        let mut rows: Vec<DeviceDeployment> = self
            .scan_tenant::<DeviceDeployment>(DEVICE_DEPLOYMENTS, tenant)?
            .into_iter()
            .filter(|dd| {
                &dd.device_id == device_id
                    && (include_deleted || dd.deleted.is_none())
                    && active.map_or(true, |a| dd.active == a)
            })
            .collect();
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
        let mut observed = None;
        self.with_device_deployments(
            tenant,
            |dd| dd.deployment_id == deployment_id && &dd.device_id == device_id,
            |dd| {
                observed = Some(dd.status);
                if dd.status != expected {
                    return false;
                }
                dd.status = state.status;
                dd.active = state.status.is_active();
                dd.set_substate(state.substate.clone());
                if let Some(finished) = state.finished {
                    if dd.finished.is_none() {
                        dd.finished = Some(finished);
                    }
                }
                true
            },
            |_| (),
        )?;
        observed.ok_or(StoreError::NotFound)
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
        let mut row = None;
        self.with_device_deployments(
            tenant,
            |dd| dd.deployment_id == deployment_id && &dd.device_id == device_id,
            |dd| {
                let won = dd.image.is_none() && dd.status == DeviceDeploymentStatus::Pending;
                if won {
                    dd.image = Some(image);
                    dd.request = Some(request.clone());
                    dd.started = Some(now);
                }
                row = Some(dd.clone());
                won
            },
            |_| (),
        )?;
        row.ok_or(StoreError::NotFound)
    }

    async fn increment_device_deployment_attempts(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
    ) -> Result<u32, StoreError> {
        let mut attempts = None;
        self.with_device_deployments(
            tenant,
            |dd| dd.deployment_id == deployment_id && &dd.device_id == device_id,
            |dd| {
                dd.attempts += 1;
                attempts = Some(dd.attempts);
                true
            },
            |_| (),
        )?;
        attempts.ok_or(StoreError::NotFound)
    }

    async fn set_device_deployment_log_availability(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
        log_available: bool,
    ) -> Result<(), StoreError> {
        let mut found = false;
        self.with_device_deployments(
            tenant,
            |dd| dd.deployment_id == deployment_id && &dd.device_id == device_id,
            |dd| {
                dd.log_available = log_available;
                found = true;
                true
            },
            |_| (),
        )?;
        if found {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn aggregate_device_deployment_counts(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
    ) -> Result<Stats, StoreError> {
        let rows = self.scan_tenant::<DeviceDeployment>(DEVICE_DEPLOYMENTS, tenant)?;
        Ok(query::aggregate_counts(
            rows.iter().filter(|dd| dd.deployment_id == deployment_id),
        ))
    }

    async fn find_device_deployments_for_deployment(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        filter: Option<DeviceStateFilter>,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<DeviceDeployment>, u64), StoreError> {
        let mut rows: Vec<DeviceDeployment> = self
            .scan_tenant::<DeviceDeployment>(DEVICE_DEPLOYMENTS, tenant)?
            .into_iter()
            .filter(|dd| {
                dd.deployment_id == deployment_id && filter.map_or(true, |f| f.matches(dd.status))
            })
            .collect();
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
        Ok(self
            .scan_tenant::<DeviceDeployment>(DEVICE_DEPLOYMENTS, tenant)?
            .into_iter()
            .find(|dd| dd.deployment_id == deployment_id && &dd.device_id == device_id))
    }

    async fn abort_device_deployments(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.with_device_deployments(
            tenant,
            |dd| dd.deployment_id == deployment_id && dd.active,
            |dd| {
                dd.set_status(DeviceDeploymentStatus::Aborted, now);
                true
            },
            |touched| touched.len() as u64,
        )
    }

    async fn decommission_device_deployments(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeploymentId>, StoreError> {
        self.with_device_deployments(
            tenant,
            |dd| &dd.device_id == device_id && dd.active,
            |dd| {
                dd.set_status(DeviceDeploymentStatus::Decommissioned, now);
                true
            },
            |touched| {
                let affected: BTreeSet<DeploymentId> =
                    touched.iter().map(|dd| dd.deployment_id).collect();
                affected.into_iter().collect()
            },
        )
    }

    async fn delete_device_deployments_for_device(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_device_deployments(
            tenant,
            |dd| &dd.device_id == device_id && dd.deleted.is_none(),
            |dd| {
                dd.deleted = Some(now);
                true
            },
            |_| (),
        )
    }

    // ── Device logs ──────────────────────────────────────────────────────

    async fn save_deployment_log(
        &self,
        tenant: &Tenant,
        log: &DeploymentLog,
    ) -> Result<(), StoreError> {
        let k = key(
            tenant,
            &format!("{}{}{}", log.deployment_id, SEP, log.device_id),
        );
        self.put_doc(DEVICE_LOGS, &k, log)
    }

    async fn get_deployment_log(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
    ) -> Result<Option<DeploymentLog>, StoreError> {
        let k = key(tenant, &format!("{}{}{}", deployment_id, SEP, device_id));
        self.get_doc(DEVICE_LOGS, &k)
    }

    // ── Images ───────────────────────────────────────────────────────────

    async fn insert_image(&self, tenant: &Tenant, image: &Image) -> Result<(), StoreError> {
        let (start, end) = tenant_range(tenant);
        let k = key(tenant, &image.id.to_string());
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(IMAGES).map_err(internal)?;
            if table.get(k.as_str()).map_err(internal)?.is_some() {
                return Err(StoreError::InvalidInput(format!(
                    "image {} already exists",
                    image.id
                )));
            }
            // The uniqueness index: same name, overlapping device type,
            // overlapping depends tuple.
            for entry in table
                .range(start.as_str()..end.as_str())
                .map_err(internal)?
            {
                let (_k, v) = entry.map_err(internal)?;
                let existing: Image = serde_json::from_slice(v.value())?;
                if existing.name != image.name {
                    continue;
                }
                if let Some((device_type, depends)) = query::image_conflict(image, &existing) {
                    return Err(StoreError::ArtifactConflict {
                        name: image.name.clone(),
                        device_type,
                        depends,
                    });
                }
            }
            let bytes = serde_json::to_vec(image)?;
            table.insert(k.as_str(), bytes.as_slice()).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn find_image(
        &self,
        tenant: &Tenant,
        id: ImageId,
    ) -> Result<Option<Image>, StoreError> {
        self.get_doc(IMAGES, &key(tenant, &id.to_string()))
    }

    async fn update_image_description(
        &self,
        tenant: &Tenant,
        id: ImageId,
        description: String,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let k = key(tenant, &id.to_string());
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(IMAGES).map_err(internal)?;
            let mut image: Image = match table.get(k.as_str()).map_err(internal)? {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => return Err(StoreError::NotFound),
            };
            image.description = description;
            image.modified = now;
            let bytes = serde_json::to_vec(&image)?;
            table.insert(k.as_str(), bytes.as_slice()).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn list_images(
        &self,
        tenant: &Tenant,
        filter: &ImageFilter,
    ) -> Result<Vec<Image>, StoreError> {
        let mut images: Vec<Image> = self
            .scan_tenant::<Image>(IMAGES, tenant)?
            .into_iter()
            .filter(|i| query::matches_image_filter(i, filter))
            .collect();
        query::sort_images(&mut images, filter.sort, filter.order);
        let skip = filter.page.saturating_sub(1) * filter.per_page;
        Ok(query::page(images, skip, filter.per_page))
    }

    async fn delete_image(&self, tenant: &Tenant, id: ImageId) -> Result<(), StoreError> {
        let k = key(tenant, &id.to_string());
        let wtxn = self.db.begin_write().map_err(internal)?;
        let removed = {
            let mut table = wtxn.open_table(IMAGES).map_err(internal)?;
            let result = table.remove(k.as_str()).map_err(internal)?.is_some();
            result
        };
        wtxn.commit().map_err(internal)?;
        if removed {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn delete_images_by_name(
        &self,
        tenant: &Tenant,
        name: &str,
    ) -> Result<Vec<ImageId>, StoreError> {
        let ids: Vec<ImageId> = self
            .scan_tenant::<Image>(IMAGES, tenant)?
            .into_iter()
            .filter(|i| i.name == name)
            .map(|i| i.id)
            .collect();
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(IMAGES).map_err(internal)?;
            for id in &ids {
                table
                    .remove(key(tenant, &id.to_string()).as_str())
                    .map_err(internal)?;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(ids)
    }

    async fn images_by_name(
        &self,
        tenant: &Tenant,
        name: &str,
    ) -> Result<Vec<Image>, StoreError> {
        let mut images: Vec<Image> = self
            .scan_tenant::<Image>(IMAGES, tenant)?
            .into_iter()
            .filter(|i| i.name == name)
            .collect();
        images.sort_by(|a, b| a.modified.cmp(&b.modified));
        Ok(images)
    }

    async fn image_by_ids_and_device_type(
        &self,
        tenant: &Tenant,
        ids: &[ImageId],
        device_type: &str,
    ) -> Result<Option<Image>, StoreError> {
        let candidates: Vec<Image> = self
            .scan_tenant::<Image>(IMAGES, tenant)?
            .into_iter()
            .filter(|i| ids.contains(&i.id) && i.supports_device_type(device_type))
            .collect();
        Ok(query::smallest(candidates))
    }

    async fn image_by_name_and_device_type(
        &self,
        tenant: &Tenant,
        name: &str,
        device_type: &str,
    ) -> Result<Option<Image>, StoreError> {
        let candidates: Vec<Image> = self
            .scan_tenant::<Image>(IMAGES, tenant)?
            .into_iter()
            .filter(|i| i.name == name && i.supports_device_type(device_type))
            .collect();
        Ok(query::smallest(candidates))
    }

    // ── Releases and tags ────────────────────────────────────────────────

    async fn list_releases(
        &self,
        tenant: &Tenant,
        filter: &ReleaseFilter,
    ) -> Result<Vec<Release>, StoreError> {
        let images = self.scan_tenant::<Image>(IMAGES, tenant)?;
        let names: BTreeSet<String> = images.iter().map(|i| i.name.clone()).collect();
        let mut releases = Vec::new();
        for name in names {
            let group: Vec<Image> = images.iter().filter(|i| i.name == name).cloned().collect();
            let meta: ReleaseMeta = self
                .get_doc(RELEASES, &key(tenant, &name))?
                .unwrap_or_default();
            if let Some(release) = Release::from_images(group, meta.tags, meta.notes) {
                if query::matches_release_filter(&release, filter) {
                    releases.push(release);
                }
            }
        }
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
        if !self
            .scan_tenant::<Image>(IMAGES, tenant)?
            .iter()
            .any(|i| i.name == name)
        {
            return Err(StoreError::NotFound);
        }
        let tags: BTreeSet<Tag> = tags.into_iter().collect();
        if tags.len() > MAX_TAGS_PER_RELEASE {
            return Err(StoreError::TooManyTags {
                limit: MAX_TAGS_PER_RELEASE,
            });
        }
        let (start, end) = tenant_range(tenant);
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(RELEASES).map_err(internal)?;
            let mut unique: BTreeSet<Tag> = BTreeSet::new();
            for entry in table
                .range(start.as_str()..end.as_str())
                .map_err(internal)?
            {
                let (k, v) = entry.map_err(internal)?;
                if k.value() == key(tenant, name) {
                    continue;
                }
                let meta: ReleaseMeta = serde_json::from_slice(v.value())?;
                unique.extend(meta.tags);
            }
            unique.extend(tags.iter().cloned());
            if unique.len() > MAX_UNIQUE_TAGS_PER_TENANT {
                return Err(StoreError::TooManyUniqueTags {
                    limit: MAX_UNIQUE_TAGS_PER_TENANT,
                });
            }
            let k = key(tenant, name);
            let mut meta: ReleaseMeta = match table.get(k.as_str()).map_err(internal)? {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => ReleaseMeta::default(),
            };
            meta.tags = tags.into_iter().collect();
            let bytes = serde_json::to_vec(&meta)?;
            table.insert(k.as_str(), bytes.as_slice()).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn list_tags(&self, tenant: &Tenant) -> Result<Vec<Tag>, StoreError> {
        let metas = self.scan_tenant::<ReleaseMeta>(RELEASES, tenant)?;
        let tags: BTreeSet<Tag> = metas.into_iter().flat_map(|m| m.tags).collect();
        Ok(tags.into_iter().collect())
    }

    async fn list_update_types(&self, tenant: &Tenant) -> Result<Vec<String>, StoreError> {
        let images = self.scan_tenant::<Image>(IMAGES, tenant)?;
        let types: BTreeSet<String> = images
            .into_iter()
            .flat_map(|i| i.updates.into_iter().map(|p| p.type_info))
            .collect();
        Ok(types.into_iter().collect())
    }

    async fn update_release_notes(
        &self,
        tenant: &Tenant,
        name: &str,
        notes: String,
    ) -> Result<(), StoreError> {
        if !self
            .scan_tenant::<Image>(IMAGES, tenant)?
            .iter()
            .any(|i| i.name == name)
        {
            return Err(StoreError::NotFound);
        }
        let k = key(tenant, name);
        let mut meta: ReleaseMeta = self.get_doc(RELEASES, &k)?.unwrap_or_default();
        meta.notes = notes;
        self.put_doc(RELEASES, &k, &meta)
    }

    async fn delete_releases_by_name(
        &self,
        tenant: &Tenant,
        name: &str,
    ) -> Result<(), StoreError> {
        let k = key(tenant, name);
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(RELEASES).map_err(internal)?;
            table.remove(k.as_str()).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    // ── Upload intents ───────────────────────────────────────────────────

    async fn insert_upload_intent(&self, intent: &UploadIntent) -> Result<(), StoreError> {
        let k = intent.id.to_string();
        if self.get_doc::<UploadIntent>(INTENTS, &k)?.is_some() {
            return Err(StoreError::InvalidInput(format!(
                "upload intent {} already exists",
                intent.id
            )));
        }
        self.put_doc(INTENTS, &k, intent)
    }

    async fn get_upload_intent(
        &self,
        tenant: &Tenant,
        id: ImageId,
    ) -> Result<Option<UploadIntent>, StoreError> {
        Ok(self
            .get_doc::<UploadIntent>(INTENTS, &id.to_string())?
            .filter(|i| &i.tenant == tenant))
    }

    async fn update_upload_intent_status(
        &self,
        tenant: &Tenant,
        id: ImageId,
        expected: IntentStatus,
        new: IntentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let k = id.to_string();
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(INTENTS).map_err(internal)?;
            let mut intent: UploadIntent = match table.get(k.as_str()).map_err(internal)? {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => return Err(StoreError::NotFound),
            };
            if &intent.tenant != tenant || intent.status != expected {
                return Err(StoreError::NotFound);
            }
            intent.status = new;
            intent.updated = now;
            let bytes = serde_json::to_vec(&intent)?;
            table.insert(k.as_str(), bytes.as_slice()).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn scan_expired_upload_intents(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Box<dyn IntentCursor>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(INTENTS).map_err(internal)?;
        let mut items = Vec::new();
        for entry in table.iter().map_err(internal)? {
            let (_k, v) = entry.map_err(internal)?;
            let intent: UploadIntent = serde_json::from_slice(v.value())?;
            if intent.updated < before {
                items.push(intent);
            }
        }
        items.sort_by(|a, b| a.updated.cmp(&b.updated));
        Ok(Box::new(RedbIntentCursor {
            items: items.into(),
            closed: false,
        }))
    }

    // ── Settings and limits ──────────────────────────────────────────────

    async fn get_storage_settings(
        &self,
        tenant: &Tenant,
    ) -> Result<Option<StorageSettings>, StoreError> {
        self.get_doc(SETTINGS, tenant.as_str())
    }

    async fn set_storage_settings(
        &self,
        tenant: &Tenant,
        settings: &StorageSettings,
    ) -> Result<(), StoreError> {
        self.put_doc(SETTINGS, tenant.as_str(), settings)
    }

    async fn get_storage_limit(&self, tenant: &Tenant) -> Result<Option<u64>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(LIMITS).map_err(internal)?;
        Ok(table
            .get(tenant.as_str())
            .map_err(internal)?
            .map(|guard| guard.value()))
    }

    async fn set_storage_limit(
        &self,
        tenant: &Tenant,
        limit: Option<u64>,
    ) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(LIMITS).map_err(internal)?;
            match limit {
                Some(limit) => {
                    table.insert(tenant.as_str(), limit).map_err(internal)?;
                }
                None => {
                    table.remove(tenant.as_str()).map_err(internal)?;
                }
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }
}
