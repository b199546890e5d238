//! Deployment planner: validates a constructor, resolves the target device
//! set, and materialises the deployment with its per-device rows.

use chrono::Utc;
use overdrop_domain::{
    Deployment, DeploymentConstructor, DeploymentType, DeviceDeployment, DeviceId, Tenant,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::Engine;

impl Engine {
    /// Create a software deployment from a user-supplied constructor.
    pub async fn create_deployment(
        &self,
        tenant: &Tenant,
        constructor: DeploymentConstructor,
    ) -> Result<Deployment, EngineError> {
        constructor.validate()?;

        let devices = self.resolve_target(tenant, &constructor).await?;
        if devices.is_empty() {
            return Err(EngineError::NoDevices);
        }

        // Candidate artifacts are resolved up front. An empty set is still
        // accepted: every device then resolves to noartifact at poll time.
        let artifacts: Vec<_> = self
            .store
            .images_by_name(tenant, &constructor.artifact_name)
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect();
        debug!(
            artifact = %constructor.artifact_name,
            candidates = artifacts.len(),
            devices = devices.len(),
            "resolved deployment inputs"
        );

        let mut deployment =
            Deployment::from_constructor(&constructor, artifacts, devices, Utc::now());
        if let Some(group) = &constructor.group {
            deployment.groups = vec![group.clone()];
        }
        self.store.insert_deployment(tenant, &deployment).await?;
        self.enroll_devices(tenant, &deployment).await?;

        info!(deployment = %deployment.id, max_devices = deployment.max_devices, "created deployment");
        self.store
            .find_deployment(tenant, deployment.id)
            .await?
            .ok_or(EngineError::NotFound)
    }

    /// Create a single-device configuration deployment. The configuration
    /// blob travels on the deployment; already-installed suppression never
    /// applies to these.
    pub async fn create_configuration_deployment(
        &self,
        tenant: &Tenant,
        name: String,
        device_id: DeviceId,
        configuration: Value,
    ) -> Result<Deployment, EngineError> {
        let constructor = DeploymentConstructor {
            name: name.clone(),
            artifact_name: name,
            devices: vec![device_id],
            ..Default::default()
        };
        constructor.validate()?;

        let mut deployment = Deployment::from_constructor(
            &constructor,
            Vec::new(),
            constructor.devices.clone(),
            Utc::now(),
        );
        deployment.deployment_type = DeploymentType::Configuration;
        deployment.configuration = Some(configuration);
        self.store.insert_deployment(tenant, &deployment).await?;
        self.enroll_devices(tenant, &deployment).await?;

        self.store
            .find_deployment(tenant, deployment.id)
            .await?
            .ok_or(EngineError::NotFound)
    }

    async fn resolve_target(
        &self,
        tenant: &Tenant,
        constructor: &DeploymentConstructor,
    ) -> Result<Vec<DeviceId>, EngineError> {
        if !constructor.devices.is_empty() {
            return Ok(constructor.devices.clone());
        }

        // all_devices or a group: page through the inventory, trusting the
        // total it reports as the termination condition.
        let group = constructor.group.as_deref();
        let per_page = self.config.inventory_page_size;
        let mut devices = Vec::new();
        let mut page = 1;
        loop {
            let result = self
                .inventory
                .search_devices(tenant, group, page, per_page)
                .await?;
            let fetched = result.devices.len();
            devices.extend(result.devices);
            if devices.len() as u64 >= result.total || fetched == 0 {
                break;
            }
            page += 1;
        }
        Ok(devices)
    }

    /// Insert the per-device rows in batches; every batch bumps the
    /// parent's device-count as part of the same store call.
    async fn enroll_devices(
        &self,
        tenant: &Tenant,
        deployment: &Deployment,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        for chunk in deployment.device_list.chunks(self.config.insert_batch_size.max(1)) {
            let rows: Vec<DeviceDeployment> = chunk
                .iter()
                .map(|device| DeviceDeployment::new(deployment.id, device.clone(), now))
                .collect();
            self.store.insert_device_deployments(tenant, &rows).await?;
        }
        Ok(())
    }
}
