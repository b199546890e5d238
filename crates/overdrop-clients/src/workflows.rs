use std::time::Duration;

use overdrop_domain::{DeploymentId, DeviceId, ImageId, Tenant};
use serde::Serialize;
use tracing::debug;

use crate::error::ClientError;

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Inputs for the artifact-generation workflow kicked off on upload commit.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateArtifactArgs {
    pub tenant_id: String,
    pub artifact_id: String,
    pub artifact_name: String,
    pub device_types: Vec<String>,
    /// Object key of the staged upload the workflow reads from.
    pub object_key: String,
}

#[derive(Debug, Serialize)]
struct ReindexDeviceArgs<'a> {
    tenant_id: &'a str,
    device_id: &'a str,
    service: &'a str,
}

#[derive(Debug, Serialize)]
struct ReindexDeploymentArgs<'a> {
    tenant_id: &'a str,
    device_id: &'a str,
    deployment_id: String,
    service: &'a str,
}

/// Client for the workflows service. Reindex signals are best-effort:
/// callers log failures at warn and move on, never inside the hot path's
/// transaction.
#[derive(Clone)]
pub struct WorkflowsClient {
    base_url: String,
    client: reqwest::Client,
}

impl WorkflowsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        WorkflowsClient {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(CALL_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    async fn start<T: Serialize>(&self, workflow: &str, args: &T) -> Result<(), ClientError> {
        let url = format!(
            "{}/api/v1/workflow/{}",
            self.base_url.trim_end_matches('/'),
            workflow
        );
        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        debug!(workflow, "workflow started");
        Ok(())
    }

    pub async fn start_generate_artifact(
        &self,
        args: &GenerateArtifactArgs,
    ) -> Result<(), ClientError> {
        self.start("generate_artifact", args).await
    }

    pub async fn reindex_device(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
    ) -> Result<(), ClientError> {
        self.start(
            "reindex_reporting",
            &ReindexDeviceArgs {
                tenant_id: tenant.as_str(),
                device_id: device_id.as_str(),
                service: "deployments",
            },
        )
        .await
    }

    pub async fn reindex_deployment(
        &self,
        tenant: &Tenant,
        device_id: &DeviceId,
        deployment_id: DeploymentId,
    ) -> Result<(), ClientError> {
        self.start(
            "reindex_reporting_deployment",
            &ReindexDeploymentArgs {
                tenant_id: tenant.as_str(),
                device_id: device_id.as_str(),
                deployment_id: deployment_id.to_string(),
                service: "deployments",
            },
        )
        .await
    }

    /// Liveness probe used by the readiness endpoint.
    pub async fn health(&self) -> Result<(), ClientError> {
        let url = format!("{}/status", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ClientError::Api {
                status: response.status().as_u16(),
                message: String::new(),
            })
        }
    }
}

/// Helper building [`GenerateArtifactArgs`] from domain ids.
impl GenerateArtifactArgs {
    pub fn new(
        tenant: &Tenant,
        artifact_id: ImageId,
        artifact_name: impl Into<String>,
        device_types: Vec<String>,
        object_key: impl Into<String>,
    ) -> Self {
        GenerateArtifactArgs {
            tenant_id: tenant.as_str().to_string(),
            artifact_id: artifact_id.to_string(),
            artifact_name: artifact_name.into(),
            device_types,
            object_key: object_key.into(),
        }
    }
}
