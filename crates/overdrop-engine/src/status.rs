//! Status engine: applies device-reported transitions, keeps the parent
//! deployment's counters and lifecycle in step, and repairs stat drift.

use chrono::Utc;
use overdrop_domain::{
    Deployment, DeploymentId, DeploymentLog, DeviceDeploymentStatus, DeviceId, LogMessage,
    Stats, Tenant,
};
use overdrop_store::{DeploymentQuery, DeviceDeploymentState};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::Engine;

impl Engine {
    /// Apply one device-reported transition.
    ///
    /// A terminal row absorbs further reports: re-reporting the same status
    /// is an idempotent no-op, anything else is a conflict (the abort
    /// stands). Counter bumps derive from the status the CAS observed, so a
    /// racer that lost changes nothing.
    pub async fn update_device_status(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
        reported: DeviceDeploymentStatus,
        substate: Option<String>,
    ) -> Result<(), EngineError> {
        let dd = self
            .store
            .get_device_deployment(tenant, deployment_id, device_id)
            .await?
            .ok_or(EngineError::NotFound)?;

        if dd.status.is_terminal() {
            if dd.status == reported {
                return Ok(());
            }
            return Err(EngineError::Conflict(format!(
                "device-deployment already {}",
                dd.status
            )));
        }

        let now = Utc::now();
        let observed = self
            .store
            .update_device_deployment_status(
                tenant,
                deployment_id,
                device_id,
                dd.status,
                DeviceDeploymentState {
                    status: reported,
                    substate,
                    finished: reported.is_terminal().then_some(now),
                },
            )
            .await?;
        if observed != dd.status {
            // Lost the race; whoever won already moved the counters.
            debug!(
                deployment = %deployment_id,
                device = %device_id,
                expected = %dd.status,
                observed = %observed,
                "status update lost its race"
            );
            return Ok(());
        }

        let deployment = self
            .store
            .increment_deployment_stat(tenant, deployment_id, Some(observed), reported, now)
            .await?;
        if deployment.finished == Some(now) {
            info!(deployment = %deployment_id, "deployment finished");
        }
        self.signal_reindex(tenant, device_id, deployment_id).await;
        Ok(())
    }

    pub async fn get_deployment(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
    ) -> Result<Deployment, EngineError> {
        self.store
            .find_deployment(tenant, id)
            .await?
            .ok_or(EngineError::NotFound)
    }

    pub async fn find_deployments(
        &self,
        tenant: &Tenant,
        query: &DeploymentQuery,
    ) -> Result<(Vec<Deployment>, u64), EngineError> {
        Ok(self.store.find_deployments(tenant, query).await?)
    }

    pub async fn deployment_stats(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
    ) -> Result<Stats, EngineError> {
        Ok(self.get_deployment(tenant, id).await?.stats)
    }

    /// Drift repair: recompute the aggregate counters from the rows and
    /// write them back. Used after recoveries; aggregate stats are only
    /// eventually consistent with the row statuses.
    pub async fn recalculate_stats(
        &self,
        tenant: &Tenant,
        id: DeploymentId,
    ) -> Result<Deployment, EngineError> {
        let stats = self
            .store
            .aggregate_device_deployment_counts(tenant, id)
            .await?;
        Ok(self
            .store
            .set_deployment_stats(tenant, id, stats, Utc::now())
            .await?)
    }

    // ── Device logs ──────────────────────────────────────────────────────

    pub async fn save_device_log(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
        messages: Vec<LogMessage>,
    ) -> Result<(), EngineError> {
        self.store
            .get_device_deployment(tenant, deployment_id, device_id)
            .await?
            .ok_or(EngineError::NotFound)?;
        let log = DeploymentLog {
            deployment_id,
            device_id: device_id.clone(),
            messages,
        };
        log.validate()?;
        self.store.save_deployment_log(tenant, &log).await?;
        self.store
            .set_device_deployment_log_availability(tenant, deployment_id, device_id, true)
            .await?;
        Ok(())
    }

    pub async fn get_device_log(
        &self,
        tenant: &Tenant,
        deployment_id: DeploymentId,
        device_id: &DeviceId,
    ) -> Result<DeploymentLog, EngineError> {
        self.store
            .get_deployment_log(tenant, deployment_id, device_id)
            .await?
            .ok_or(EngineError::NotFound)
    }
}
