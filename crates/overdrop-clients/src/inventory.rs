use std::time::Duration;

use overdrop_domain::{DeviceId, Tenant};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClientError;

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// One page of an inventory search plus the total match count the service
/// reports. The total is what pagination loops trust as their termination
/// condition.
#[derive(Debug, Clone)]
pub struct DevicePage {
    pub devices: Vec<DeviceId>,
    pub total: u64,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    page: usize,
    per_page: usize,
    filters: Vec<SearchFilter<'a>>,
}

#[derive(Debug, Serialize)]
struct SearchFilter<'a> {
    scope: &'a str,
    attribute: &'a str,
    #[serde(rename = "type")]
    predicate: &'a str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct SearchDevice {
    id: String,
}

/// Client for the device inventory service: resolves deployment target
/// sets. Connection-pooled; safe to share across tasks.
#[derive(Clone)]
pub struct InventoryClient {
    base_url: String,
    client: reqwest::Client,
}

impl InventoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        InventoryClient {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(CALL_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    /// Search accepted devices, optionally restricted to one group.
    pub async fn search_devices(
        &self,
        tenant: &Tenant,
        group: Option<&str>,
        page: usize,
        per_page: usize,
    ) -> Result<DevicePage, ClientError> {
        let mut filters = vec![SearchFilter {
            scope: "identity",
            attribute: "status",
            predicate: "$eq",
            value: "accepted",
        }];
        if let Some(group) = group {
            filters.push(SearchFilter {
                scope: "system",
                attribute: "group",
                predicate: "$eq",
                value: group,
            });
        }
        let url = format!(
            "{}/api/internal/v2/inventory/tenants/{}/filters/search",
            self.base_url.trim_end_matches('/'),
            tenant
        );
        let response = self
            .client
            .post(&url)
            .json(&SearchRequest {
                page,
                per_page,
                filters,
            })
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
        let total = response
            .headers()
            .get("X-Total-Count")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ClientError::Decode("missing X-Total-Count header".into()))?;
        let devices: Vec<SearchDevice> = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        debug!(page, total, n = devices.len(), "inventory search page");
        Ok(DevicePage {
            devices: devices.into_iter().map(|d| DeviceId::new(d.id)).collect(),
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn search_reads_page_and_total() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/internal/v2/inventory/tenants/acme/filters/search"))
            .and(body_partial_json(serde_json::json!({
                "page": 1,
                "per_page": 512,
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Total-Count", "3")
                    .set_body_json(serde_json::json!([
                        {"id": "d1"}, {"id": "d2"}
                    ])),
            )
            .mount(&server)
            .await;

        let client = InventoryClient::new(server.uri());
        let page = client
            .search_devices(&Tenant::new("acme"), None, 1, 512)
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.devices, vec![DeviceId::new("d1"), DeviceId::new("d2")]);
    }

    #[tokio::test]
    async fn group_filter_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "filters": [
                    {"scope": "identity", "attribute": "status", "type": "$eq", "value": "accepted"},
                    {"scope": "system", "attribute": "group", "type": "$eq", "value": "canary"},
                ]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Total-Count", "0")
                    .set_body_json(serde_json::json!([])),
            )
            .mount(&server)
            .await;

        let client = InventoryClient::new(server.uri());
        let page = client
            .search_devices(&Tenant::single(), Some("canary"), 1, 512)
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn upstream_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = InventoryClient::new(server.uri());
        let err = client
            .search_devices(&Tenant::single(), None, 1, 512)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Api { status: 500, .. }));
    }
}
