//! Terminal sweeps: deployment abort and device decommission. Both are
//! idempotent; re-running lands on the same terminal state.

use chrono::{DateTime, Utc};
use overdrop_domain::{DeploymentId, DeploymentStatus, DeviceDeploymentStatus, DeviceId, Tenant};
use tracing::info;

use crate::error::EngineError;
use crate::Engine;

impl Engine {
    /// Abort a deployment: every active device-deployment flips to
    /// `Aborted`, the stats are recomputed from the rows, and the
    /// deployment finishes. Re-aborting an aborted deployment is a no-op;
    /// aborting one that ran to completion is a conflict.
    pub async fn abort_deployment(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
    ) -> Result<(), EngineError> {
        let deployment = self.get_deployment(tenant, id).await?;
        if deployment.finished.is_some() {
            if deployment.stats.get(DeviceDeploymentStatus::Aborted) > 0 {
                return Ok(());
            }
            return Err(EngineError::Conflict(
                "deployment already finished".into(),
            ));
        }

        let now = Utc::now();
        let swept = self.store.abort_device_deployments(tenant, id, now).await?;
        let stats = self
            .store
            .aggregate_device_deployment_counts(tenant, id)
            .await?;
        let updated = self
            .store
            .set_deployment_stats(tenant, id, stats, now)
            .await?;
        // Devices never enrolled cannot keep the deployment open: force
        // the terminal state regardless of max-devices.
        self.store
            .set_deployment_status(
                tenant,
                id,
                DeploymentStatus::Finished,
                updated.finished.is_none().then_some(now),
            )
            .await?;

        info!(deployment = %id, swept, "aborted deployment");
        Ok(())
    }

    /// Decommission a device: all of its active slots become
    /// `Decommissioned`, affected deployments get their stats recomputed,
    /// newer pending explicit-list deployments drop the device, and the
    /// history is soft-deleted.
    pub async fn decommission_device(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let horizon = self.decommission_horizon(tenant, device_id).await?;

        let affected = self
            .store
            .decommission_device_deployments(tenant, device_id, now)
            .await?;
        for deployment_id in &affected {
            self.recalculate_stats(tenant, *deployment_id).await?;
        }

        // Newer active deployments that enumerate this device but never
        // enrolled a row for it will never see it poll: shrink their
        // pending set now. Deployments with a row (even a terminal or
        // soft-deleted one) were settled by the sweep above.
        let mut skip = 0;
        loop {
            let batch = self
                .store
                .find_newer_active_deployments(tenant, horizon, skip, 100)
                .await?;
            if batch.is_empty() {
                break;
            }
            skip += batch.len();
            for deployment in &batch {
                if !deployment.device_list.contains(device_id) {
                    continue;
                }
                let enrolled = self
                    .store
                    .get_device_deployment(tenant, deployment.id, device_id)
                    .await?
                    .is_some();
                if !enrolled {
                    self.store
                        .remove_pending_device(tenant, deployment.id, device_id, now)
                        .await?;
                }
            }
        }

        self.store
            .delete_device_deployments_for_device(tenant, device_id, now)
            .await?;

        if let Err(e) = self.workflows.reindex_device(tenant, device_id).await {
            tracing::warn!(device = %device_id, error = %e, "reindex signal failed");
        }
        info!(device = %device_id, deployments = affected.len(), "decommissioned device");
        Ok(())
    }

    /// "Newer" for decommission purposes: anything created after the
    /// device's latest slot. A device with no history sweeps everything.
    async fn decommission_horizon(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
    ) -> Result<DateTime<Utc>, EngineError> {
        let latest = self
            .store
            .find_latest_device_deployment(tenant, device_id, None)
            .await?;
        Ok(latest
            .map(|dd| dd.created)
            .unwrap_or(DateTime::<Utc>::MIN_UTC))
    }
}
