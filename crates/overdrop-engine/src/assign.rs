//! Poll-time artifact assignment: picks the right artifact for a device,
//! or resolves the slot to `noartifact` / `already-installed`.

use chrono::Utc;
use overdrop_domain::{
    depends_satisfied, Deployment, DeploymentId, DeploymentType, DeviceDeployment,
    DeviceDeploymentStatus, DeviceId, Image, InstalledArtifact, Tenant, UploadLink,
};
use overdrop_objstore::artifact_object;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::Engine;

/// What a successful poll hands back to the device. `id` is the deployment
/// id the device reports status against.
#[derive(Debug, Clone)]
pub struct DeviceWork {
    pub id: DeploymentId,
    pub deployment_type: DeploymentType,
    pub artifact_name: String,
    pub device_types_compatible: Vec<String>,
    /// Presigned artifact download; absent for configuration deployments.
    pub link: Option<UploadLink>,
    pub configuration: Option<Value>,
}

/// Whether `already-installed` suppression applies. Configuration
/// deployments always reapply: the installed artifact name says nothing
/// about whether the configuration matches.
fn already_installed_applies(deployment: &Deployment) -> bool {
    deployment.deployment_type != DeploymentType::Configuration
}

impl Engine {
    /// The device poll. Returns the next piece of work for the device, or
    /// `None` when there is nothing to do.
    pub async fn next_deployment(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        installed: InstalledArtifact,
    ) -> Result<Option<DeviceWork>, EngineError> {
        let Some(dd) = self
            .store
            .find_oldest_active_device_deployment(tenant, device_id)
            .await?
        else {
            return Ok(None);
        };

        let Some(deployment) = self.store.find_deployment(tenant, dd.deployment_id).await?
        else {
            return Err(EngineError::Internal(format!(
                "device-deployment {} references missing deployment {}",
                dd.id, dd.deployment_id
            )));
        };

        // An aborted deployment whose sweep raced this row: the abort
        // stands, propagate it.
        if !deployment.is_active() {
            self.finalize(tenant, &dd, DeviceDeploymentStatus::Aborted)
                .await?;
            return Ok(None);
        }

        let attempts = self
            .store
            .increment_device_deployment_attempts(tenant, dd.deployment_id, device_id)
            .await?;
        if self.config.max_attempts > 0 && attempts > self.config.max_attempts {
            warn!(
                deployment = %dd.deployment_id,
                device = %device_id,
                attempts,
                "attempt ceiling exceeded"
            );
            self.finalize(tenant, &dd, DeviceDeploymentStatus::Failure)
                .await?;
            return Ok(None);
        }

        if installed.artifact_name == deployment.artifact_name
            && already_installed_applies(&deployment)
        {
            self.finalize(tenant, &dd, DeviceDeploymentStatus::AlreadyInstalled)
                .await?;
            return Ok(None);
        }

        if deployment.deployment_type == DeploymentType::Configuration {
            // No catalog artifact to assign; the blob rides on the
            // deployment itself.
            return Ok(Some(DeviceWork {
                id: deployment.id,
                deployment_type: DeploymentType::Configuration,
                artifact_name: deployment.artifact_name.clone(),
                device_types_compatible: vec![],
                link: None,
                configuration: deployment.configuration.clone(),
            }));
        }

        let Some(image) = self.select_artifact(tenant, &deployment, &installed).await? else {
            debug!(
                deployment = %deployment.id,
                device = %device_id,
                device_type = %installed.device_type,
                "no eligible artifact"
            );
            self.finalize(tenant, &dd, DeviceDeploymentStatus::NoArtifact)
                .await?;
            return Ok(None);
        };

        // Conditional on Pending with no prior assignment: a losing racer
        // observes the winner's image and serves that.
        let row = self
            .store
            .assign_device_deployment_artifact(
                tenant,
                dd.deployment_id,
                device_id,
                image.id,
                installed,
                Utc::now(),
            )
            .await?;
        let assigned = match row.image {
            Some(id) if id == image.id => image,
            Some(id) => self
                .store
                .find_image(tenant, id)
                .await?
                .ok_or(EngineError::NotFound)?,
            None => image,
        };

        let objstore = self.object_store(tenant).await?;
        let link = objstore
            .get_request(
                &artifact_object(tenant, assigned.id),
                self.config.download_expire,
                Some(&format!("{}.artifact", assigned.name)),
            )
            .await?;

        Ok(Some(DeviceWork {
            id: deployment.id,
            deployment_type: deployment.deployment_type,
            artifact_name: assigned.name.clone(),
            device_types_compatible: assigned.device_types.clone(),
            link: Some(link),
            configuration: None,
        }))
    }

    /// Explicit artifact-id list first, legacy name lookup otherwise;
    /// smallest size breaks ties; depends must be satisfied by the
    /// device-reported provides.
    async fn select_artifact(
        &self,
        tenant: &Tenant,
        deployment: &Deployment,
        installed: &InstalledArtifact,
    ) -> Result<Option<Image>, EngineError> {
        let candidate = if !deployment.artifacts.is_empty() {
            self.store
                .image_by_ids_and_device_type(
                    tenant,
                    &deployment.artifacts,
                    &installed.device_type,
                )
                .await?
        } else {
            self.store
                .image_by_name_and_device_type(
                    tenant,
                    &deployment.artifact_name,
                    &installed.device_type,
                )
                .await?
        };
        Ok(candidate.filter(|image| depends_satisfied(&image.depends, &installed.provides)))
    }

    /// Resolve a device-deployment to a terminal status from the poll path:
    /// CAS keyed by the status we read, counters bumped exactly once from
    /// the returned previous status, reindex signalled best-effort.
    pub(crate) async fn finalize(
        &self,
        tenant: &Tenant,
        dd: &DeviceDeployment,
        to: DeviceDeploymentStatus,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let observed = self
            .store
            .update_device_deployment_status(
                tenant,
                dd.deployment_id,
                &dd.device_id,
                dd.status,
                overdrop_store::DeviceDeploymentState {
                    status: to,
                    substate: None,
                    finished: Some(now),
                },
            )
            .await?;
        if observed == dd.status {
            self.store
                .increment_deployment_stat(tenant, dd.deployment_id, Some(observed), to, now)
                .await?;
            self.signal_reindex(tenant, &dd.device_id, dd.deployment_id)
                .await;
        }
        Ok(())
    }

    /// Fire-and-forget reindex signal; never fails the primary operation.
    pub(crate) async fn signal_reindex(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        deployment_id: DeploymentId,
    ) {
        if let Err(e) = self
            .workflows
            .reindex_deployment(tenant, device_id, deployment_id)
            .await
        {
            warn!(
                device = %device_id,
                deployment = %deployment_id,
                error = %e,
                "reindex signal failed"
            );
        }
    }
}
