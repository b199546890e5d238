use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use overdrop_engine::Engine;
use tower_http::trace::TraceLayer;

use crate::auth::require_bearer_token;
use crate::handlers;
use crate::state::AppState;

pub fn build_app(engine: Arc<Engine>, auth_token: Arc<String>) -> Router {
    let state = AppState { engine, auth_token };

    Router::new()
        // Health
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        // Device API
        .route(
            "/api/devices/v2/deployments/device/deployments/next",
            post(handlers::next_deployment),
        )
        .route(
            "/api/devices/v2/deployments/device/deployments/:id/status",
            put(handlers::put_device_status),
        )
        .route(
            "/api/devices/v2/deployments/device/deployments/:id/log",
            put(handlers::put_device_log),
        )
        // Management: deployments
        .route(
            "/api/management/v1/deployments",
            post(handlers::post_deployment).get(handlers::list_deployments),
        )
        .route(
            "/api/management/v1/deployments/:id",
            get(handlers::get_deployment),
        )
        .route(
            "/api/management/v1/deployments/:id/statistics",
            get(handlers::get_deployment_statistics),
        )
        .route(
            "/api/management/v1/deployments/:id/status",
            put(handlers::put_deployment_status),
        )
        .route(
            "/api/management/v1/deployments/:id/devices",
            get(handlers::list_deployment_devices),
        )
        .route(
            "/api/management/v1/deployments/:id/devices/:device/log",
            get(handlers::get_deployment_device_log),
        )
        .route(
            "/api/management/v1/deployments/devices/:device",
            delete(handlers::decommission_device),
        )
        .route(
            "/api/management/v1/deployments/configuration/:device",
            post(handlers::post_configuration_deployment),
        )
        // Management: artifacts
        .route(
            "/api/management/v1/artifacts",
            get(handlers::list_artifacts),
        )
        .route(
            "/api/management/v1/artifacts/link",
            post(handlers::post_artifact_link),
        )
        .route(
            "/api/management/v1/artifacts/:id",
            get(handlers::get_artifact)
                .put(handlers::put_artifact)
                .delete(handlers::delete_artifact),
        )
        .route(
            "/api/management/v1/artifacts/:id/commit",
            post(handlers::post_artifact_commit),
        )
        .route(
            "/api/management/v1/artifacts/:id/complete",
            post(handlers::post_artifact_complete),
        )
        .route(
            "/api/management/v1/artifacts/:id/fail",
            post(handlers::post_artifact_fail),
        )
        .route(
            "/api/management/v1/artifacts/:id/download",
            get(handlers::get_artifact_download),
        )
        // Management: releases
        .route(
            "/api/management/v1/releases",
            get(handlers::list_releases),
        )
        .route(
            "/api/management/v1/releases/all/tags",
            get(handlers::list_release_tags),
        )
        .route(
            "/api/management/v1/releases/all/types",
            get(handlers::list_update_types),
        )
        .route(
            "/api/management/v1/releases/:name/tags",
            put(handlers::put_release_tags),
        )
        .route(
            "/api/management/v1/releases/:name",
            axum::routing::patch(handlers::patch_release).delete(handlers::delete_release),
        )
        // Auth middleware applies to all routes above
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer_token,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use overdrop_clients::{InventoryClient, WorkflowsClient};
    use overdrop_domain::{StorageProvider, StorageSettings};
    use overdrop_engine::EngineConfig;
    use overdrop_objstore::StoreResolver;
    use overdrop_store::InMemoryStore;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_TOKEN: &str = "test-token";

    async fn test_app() -> Router {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex("^/api/v1/workflow/.*"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let defaults = StorageSettings {
            provider: StorageProvider::S3,
            bucket: "artifacts".into(),
            region: "us-east-1".into(),
            endpoint: Some(server.uri()),
            key: "AKIA".into(),
            secret: "shh".into(),
            ..Default::default()
        };
        let engine = Arc::new(Engine::new(
            Arc::new(InMemoryStore::new()),
            StoreResolver::new(Some(defaults)),
            InventoryClient::new(server.uri()),
            WorkflowsClient::new(server.uri()),
            EngineConfig::default(),
        ));
        // Keep the mock server alive for the lifetime of the app.
        std::mem::forget(server);
        build_app(engine, Arc::new(TEST_TOKEN.to_string()))
    }

    fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
            .header("x-overdrop-device", "D1");
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        builder
            .body(match body {
                Some(v) => Body::from(serde_json::to_vec(&v).unwrap()),
                None => Body::empty(),
            })
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rejects_missing_token() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = test_app().await;
        let response = app
            .oneshot(request(Method::GET, "/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn poll_without_work_is_no_content() {
        let app = test_app().await;
        let response = app
            .oneshot(request(
                Method::POST,
                "/api/devices/v2/deployments/device/deployments/next",
                Some(json!({
                    "device_provides": {
                        "artifact_name": "App123",
                        "device_type": "hammer",
                    }
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn deployment_lifecycle_over_http() {
        let app = test_app().await;

        // Create a deployment for one device.
        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/management/v1/deployments",
                Some(json!({
                    "name": "rollout",
                    "artifact_name": "App123",
                    "devices": ["D1"],
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        // The device already runs the artifact: poll resolves the slot.
        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/devices/v2/deployments/device/deployments/next",
                Some(json!({
                    "device_provides": {
                        "artifact_name": "App123",
                        "device_type": "hammer",
                    }
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(request(
                Method::GET,
                &format!("/api/management/v1/deployments/{}/statistics", id),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stats = body_json(response).await;
        assert_eq!(stats["already-installed"], json!(1));

        let response = app
            .clone()
            .oneshot(request(
                Method::GET,
                &format!("/api/management/v1/deployments/{}", id),
                None,
            ))
            .await
            .unwrap();
        let deployment = body_json(response).await;
        assert_eq!(deployment["status"], json!("finished"));

        // Listing reports the total.
        let response = app
            .oneshot(request(Method::GET, "/api/management/v1/deployments", None))
            .await
            .unwrap();
        assert_eq!(
            response
                .headers()
                .get("X-Total-Count")
                .and_then(|v| v.to_str().ok()),
            Some("1")
        );
    }

    #[tokio::test]
    async fn device_status_validation_and_conflicts() {
        let app = test_app().await;
        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/management/v1/deployments",
                Some(json!({
                    "name": "rollout",
                    "artifact_name": "App123",
                    "devices": ["D1"],
                })),
            ))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        // Unknown status value.
        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                &format!("/api/devices/v2/deployments/device/deployments/{}/status", id),
                Some(json!({"status": "warp-drive"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Server-owned status value.
        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                &format!("/api/devices/v2/deployments/device/deployments/{}/status", id),
                Some(json!({"status": "aborted"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Valid transition.
        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                &format!("/api/devices/v2/deployments/device/deployments/{}/status", id),
                Some(json!({"status": "failure"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Terminal now: a different report conflicts.
        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                &format!("/api/devices/v2/deployments/device/deployments/{}/status", id),
                Some(json!({"status": "success"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Unknown deployment: not found.
        let response = app
            .oneshot(request(
                Method::PUT,
                &format!(
                    "/api/devices/v2/deployments/device/deployments/{}/status",
                    uuid::Uuid::new_v4()
                ),
                Some(json!({"status": "installing"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn abort_endpoint_only_accepts_aborted() {
        let app = test_app().await;
        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/management/v1/deployments",
                Some(json!({
                    "name": "rollout",
                    "artifact_name": "App123",
                    "devices": ["D1"],
                })),
            ))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                &format!("/api/management/v1/deployments/{}/status", id),
                Some(json!({"status": "finished"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(request(
                Method::PUT,
                &format!("/api/management/v1/deployments/{}/status", id),
                Some(json!({"status": "aborted"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn artifact_staging_over_http() {
        let app = test_app().await;
        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/management/v1/artifacts/link",
                Some(json!({"expire_seconds": 600})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let intent = body_json(response).await;
        let id = intent["id"].as_str().unwrap().to_string();
        assert_eq!(intent["status"], json!("pending"));
        assert!(intent["link"]["uri"].as_str().unwrap().contains(".part"));

        let response = app
            .oneshot(request(
                Method::POST,
                &format!("/api/management/v1/artifacts/{}/commit", id),
                Some(json!({
                    "artifact_name": "App123",
                    "device_types": ["hammer"],
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn release_tag_caps_surface_as_conflict() {
        let app = test_app().await;
        // Register an artifact through the staging flow and its completion
        // callback.
        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/management/v1/artifacts/link",
                Some(json!({})),
            ))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_str().unwrap().to_string();
        app.clone()
            .oneshot(request(
                Method::POST,
                &format!("/api/management/v1/artifacts/{}/commit", id),
                Some(json!({"artifact_name": "App123", "device_types": ["hammer"]})),
            ))
            .await
            .unwrap();
        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                &format!("/api/management/v1/artifacts/{}/complete", id),
                Some(json!({
                    "name": "App123",
                    "device_types": ["hammer"],
                    "info": {"format": "overdrop", "version": 3},
                    "size": 2048,
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let tags: Vec<String> = (0..21).map(|i| format!("tag-{}", i)).collect();
        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                "/api/management/v1/releases/App123/tags",
                Some(json!(tags)),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                "/api/management/v1/releases/App123/tags",
                Some(json!(["stable"])),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(request(Method::GET, "/api/management/v1/releases/all/tags", None))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!(["stable"]));
    }
}
