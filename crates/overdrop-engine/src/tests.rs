#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use overdrop_clients::{InventoryClient, WorkflowsClient};
    use overdrop_domain::*;
    use overdrop_objstore::StoreResolver;
    use overdrop_store::{InMemoryStore, MetadataStore};

    use crate::catalog::{CommitUpload, NewImage};
    use crate::error::EngineError;
    use crate::uploads::UploadReaper;
    use crate::{Engine, EngineConfig};

    struct Harness {
        engine: Arc<Engine>,
        store: Arc<InMemoryStore>,
        server: MockServer,
    }

    async fn harness() -> Harness {
        harness_with(EngineConfig::default()).await
    }

    async fn harness_with(config: EngineConfig) -> Harness {
        let server = MockServer::start().await;
        // Workflows accept everything unless a test overrides them.
        Mock::given(method("POST"))
            .and(path_regex("^/api/v1/workflow/.*"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
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
            store.clone(),
            StoreResolver::new(Some(defaults)),
            InventoryClient::new(server.uri()),
            WorkflowsClient::new(server.uri()),
            config,
        ));
        Harness {
            engine,
            store,
            server,
        }
    }

    fn tenant() -> Tenant {
        Tenant::single()
    }

    fn installed(name: &str, device_type: &str) -> InstalledArtifact {
        InstalledArtifact {
            artifact_name: name.into(),
            device_type: device_type.into(),
            provides: HashMap::new(),
        }
    }

    fn new_image(name: &str, device_types: &[&str], size: i64, depends: Option<(&str, &str)>) -> NewImage {
        let mut map = HashMap::new();
        if let Some((k, v)) = depends {
            map.insert(k.to_string(), json!(v));
        }
        NewImage {
            description: String::new(),
            name: name.into(),
            device_types: device_types.iter().map(|t| t.to_string()).collect(),
            info: ArtifactInfo {
                format: "overdrop".into(),
                version: 3,
            },
            signed: false,
            updates: vec![Payload {
                type_info: "rootfs-image".into(),
                files: vec![],
            }],
            provides: HashMap::new(),
            depends: map,
            size,
        }
    }

    async fn explicit_deployment(h: &Harness, artifact: &str, devices: &[&str]) -> Deployment {
        h.engine
            .create_deployment(
                &tenant(),
                DeploymentConstructor {
                    name: artifact.into(),
                    artifact_name: artifact.into(),
                    devices: devices.iter().map(|d| DeviceId::new(*d)).collect(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    // ── Seed scenario 1: already-installed finishes the deployment ───────

    #[tokio::test]
    async fn already_installed_resolves_and_finishes() {
        let h = harness().await;
        let dep = explicit_deployment(&h, "App123", &["D1"]).await;
        assert_eq!(dep.stats.get(DeviceDeploymentStatus::Pending), 1);
        assert_eq!(dep.device_count, 1);

        let work = h
            .engine
            .next_deployment(&tenant(), &DeviceId::new("D1"), installed("App123", "hammer"))
            .await
            .unwrap();
        assert!(work.is_none());

        let dd = h
            .store
            .get_device_deployment(&tenant(), dep.id, &DeviceId::new("D1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dd.status, DeviceDeploymentStatus::AlreadyInstalled);

        let dep = h.engine.get_deployment(&tenant(), dep.id).await.unwrap();
        assert_eq!(dep.stats.get(DeviceDeploymentStatus::Pending), 0);
        assert_eq!(dep.stats.get(DeviceDeploymentStatus::AlreadyInstalled), 1);
        assert_eq!(dep.status, DeploymentStatus::Finished);
        assert!(dep.finished.is_some());
    }

    // ── Seed scenario 2: smallest eligible artifact wins ─────────────────

    #[tokio::test]
    async fn assignment_picks_smallest_image() {
        let h = harness().await;
        let a = h
            .engine
            .create_image(&tenant(), new_image("App123", &["arm7"], 1 << 20, Some(("variant", "a"))))
            .await
            .unwrap();
        h.engine
            .create_image(&tenant(), new_image("App123", &["arm7"], 10 << 20, Some(("variant", "b"))))
            .await
            .unwrap();

        let dep = explicit_deployment(&h, "App123", &["D1"]).await;

        let mut request = installed("OldApp", "arm7");
        request.provides.insert("variant".into(), "a".into());
        let work = h
            .engine
            .next_deployment(&tenant(), &DeviceId::new("D1"), request)
            .await
            .unwrap()
            .expect("work assigned");

        assert_eq!(work.id, dep.id);
        assert_eq!(work.artifact_name, "App123");
        let link = work.link.expect("download link");
        assert!(link.uri.contains("X-Amz-Signature="));

        let dd = h
            .store
            .get_device_deployment(&tenant(), dep.id, &DeviceId::new("D1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dd.image, Some(a.id));
        assert!(dd.started.is_some());
    }

    #[tokio::test]
    async fn unsatisfied_depends_resolve_to_noartifact() {
        let h = harness().await;
        h.engine
            .create_image(&tenant(), new_image("App123", &["arm7"], 1 << 20, Some(("variant", "a"))))
            .await
            .unwrap();

        let dep = explicit_deployment(&h, "App123", &["D1"]).await;

        // Device type matches but the provides lack the depends key.
        let work = h
            .engine
            .next_deployment(&tenant(), &DeviceId::new("D1"), installed("OldApp", "arm7"))
            .await
            .unwrap();
        assert!(work.is_none());

        let dep = h.engine.get_deployment(&tenant(), dep.id).await.unwrap();
        assert_eq!(dep.stats.get(DeviceDeploymentStatus::NoArtifact), 1);
        assert_eq!(dep.status, DeploymentStatus::Finished);
    }

    #[tokio::test]
    async fn incompatible_device_type_resolves_to_noartifact() {
        let h = harness().await;
        h.engine
            .create_image(&tenant(), new_image("App123", &["arm7"], 1 << 20, None))
            .await
            .unwrap();
        let dep = explicit_deployment(&h, "App123", &["D1"]).await;

        let work = h
            .engine
            .next_deployment(&tenant(), &DeviceId::new("D1"), installed("OldApp", "hammer"))
            .await
            .unwrap();
        assert!(work.is_none());
        let dep = h.engine.get_deployment(&tenant(), dep.id).await.unwrap();
        assert_eq!(dep.stats.get(DeviceDeploymentStatus::NoArtifact), 1);
    }

    // ── Attempt ceiling ──────────────────────────────────────────────────

    #[tokio::test]
    async fn attempt_ceiling_fails_the_device_deployment() {
        let h = harness_with(EngineConfig {
            max_attempts: 2,
            ..Default::default()
        })
        .await;
        h.engine
            .create_image(&tenant(), new_image("App123", &["arm7"], 1 << 20, None))
            .await
            .unwrap();
        let dep = explicit_deployment(&h, "App123", &["D1"]).await;

        for _ in 0..2 {
            let work = h
                .engine
                .next_deployment(&tenant(), &DeviceId::new("D1"), installed("OldApp", "arm7"))
                .await
                .unwrap();
            assert!(work.is_some());
        }
        // Third poll crosses the ceiling.
        let work = h
            .engine
            .next_deployment(&tenant(), &DeviceId::new("D1"), installed("OldApp", "arm7"))
            .await
            .unwrap();
        assert!(work.is_none());

        let dd = h
            .store
            .get_device_deployment(&tenant(), dep.id, &DeviceId::new("D1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dd.status, DeviceDeploymentStatus::Failure);
        assert_eq!(dd.attempts, 3);
    }

    // ── Configuration deployments always reapply ─────────────────────────

    #[tokio::test]
    async fn configuration_deployment_ignores_already_installed() {
        let h = harness().await;
        let dep = h
            .engine
            .create_configuration_deployment(
                &tenant(),
                "cfg1".into(),
                DeviceId::new("D1"),
                json!({"interval": 30}),
            )
            .await
            .unwrap();
        assert_eq!(dep.deployment_type, DeploymentType::Configuration);

        // The device claims it already runs "cfg1"; a configuration
        // deployment reapplies anyway.
        let work = h
            .engine
            .next_deployment(&tenant(), &DeviceId::new("D1"), installed("cfg1", "hammer"))
            .await
            .unwrap()
            .expect("configuration work");
        assert_eq!(work.deployment_type, DeploymentType::Configuration);
        assert_eq!(work.configuration, Some(json!({"interval": 30})));
        assert!(work.link.is_none());
    }

    // ── Seed scenario 4: abort cascade ───────────────────────────────────

    #[tokio::test]
    async fn abort_cascades_to_all_active_rows() {
        let h = harness().await;
        let dep = explicit_deployment(&h, "App123", &["d1", "d2", "d3"]).await;
        for dev in ["d1", "d2", "d3"] {
            h.engine
                .update_device_status(
                    &tenant(),
                    dep.id,
                    &DeviceId::new(dev),
                    DeviceDeploymentStatus::Installing,
                    None,
                )
                .await
                .unwrap();
        }

        h.engine.abort_deployment(&tenant(), dep.id).await.unwrap();

        let dep = h.engine.get_deployment(&tenant(), dep.id).await.unwrap();
        assert_eq!(dep.stats.get(DeviceDeploymentStatus::Aborted), 3);
        assert_eq!(dep.stats.total(), 3);
        assert_eq!(dep.status, DeploymentStatus::Finished);
        assert!(dep.finished.is_some());

        // Idempotent: aborting an aborted deployment is a no-op.
        h.engine.abort_deployment(&tenant(), dep.id).await.unwrap();

        // A device that polls afterwards finds nothing.
        let work = h
            .engine
            .next_deployment(&tenant(), &DeviceId::new("d1"), installed("x", "hammer"))
            .await
            .unwrap();
        assert!(work.is_none());
    }

    #[tokio::test]
    async fn abort_after_success_is_a_conflict() {
        let h = harness().await;
        let dep = explicit_deployment(&h, "App123", &["d1"]).await;
        h.engine
            .update_device_status(
                &tenant(),
                dep.id,
                &DeviceId::new("d1"),
                DeviceDeploymentStatus::Success,
                None,
            )
            .await
            .unwrap();
        assert!(matches!(
            h.engine.abort_deployment(&tenant(), dep.id).await,
            Err(EngineError::Conflict(_))
        ));
    }

    // ── Seed scenario 5: terminal states absorb further reports ──────────

    #[tokio::test]
    async fn status_engine_keeps_counters_consistent() {
        let h = harness().await;
        let dep = explicit_deployment(&h, "App123", &["d1"]).await;
        let dev = DeviceId::new("d1");

        for status in [
            DeviceDeploymentStatus::Downloading,
            DeviceDeploymentStatus::Installing,
            DeviceDeploymentStatus::Rebooting,
            DeviceDeploymentStatus::Failure,
        ] {
            h.engine
                .update_device_status(&tenant(), dep.id, &dev, status, None)
                .await
                .unwrap();
            let d = h.engine.get_deployment(&tenant(), dep.id).await.unwrap();
            assert_eq!(d.stats.total(), d.device_count, "after {}", status);
            assert_eq!(d.stats.get(status), 1);
        }

        // Terminal absorbs: re-reporting the same status is a no-op …
        h.engine
            .update_device_status(
                &tenant(),
                dep.id,
                &dev,
                DeviceDeploymentStatus::Failure,
                None,
            )
            .await
            .unwrap();
        // … anything else conflicts, and counters stay put.
        assert!(matches!(
            h.engine
                .update_device_status(
                    &tenant(),
                    dep.id,
                    &dev,
                    DeviceDeploymentStatus::Installing,
                    None,
                )
                .await,
            Err(EngineError::Conflict(_))
        ));
        let d = h.engine.get_deployment(&tenant(), dep.id).await.unwrap();
        assert_eq!(d.stats.get(DeviceDeploymentStatus::Failure), 1);
        assert_eq!(d.stats.total(), 1);
        assert_eq!(d.status, DeploymentStatus::Finished);
    }

    #[tokio::test]
    async fn substate_is_recorded() {
        let h = harness().await;
        let dep = explicit_deployment(&h, "App123", &["d1"]).await;
        h.engine
            .update_device_status(
                &tenant(),
                dep.id,
                &DeviceId::new("d1"),
                DeviceDeploymentStatus::Installing,
                Some("writing partition 2".into()),
            )
            .await
            .unwrap();
        let dd = h
            .store
            .get_device_deployment(&tenant(), dep.id, &DeviceId::new("d1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dd.substate.as_deref(), Some("writing partition 2"));
    }

    // ── Planner ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn group_deployment_pages_through_inventory() {
        let h = harness().await;
        // Two pages of 512 and 1, total 513.
        let page1: Vec<_> = (0..512).map(|i| json!({"id": format!("dev-{}", i)})).collect();
        Mock::given(method("POST"))
            .and(path_regex("^/api/internal/v2/inventory/.*"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Total-Count", "513")
                    .set_body_json(page1),
            )
            .up_to_n_times(1)
            .mount(&h.server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex("^/api/internal/v2/inventory/.*"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Total-Count", "513")
                    .set_body_json(json!([{"id": "dev-512"}])),
            )
            .mount(&h.server)
            .await;

        let dep = h
            .engine
            .create_deployment(
                &tenant(),
                DeploymentConstructor {
                    name: "canary rollout".into(),
                    artifact_name: "App123".into(),
                    group: Some("canary".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(dep.max_devices, 513);
        assert_eq!(dep.device_count, 513);
        assert_eq!(dep.groups, vec!["canary"]);
        assert_eq!(dep.stats.get(DeviceDeploymentStatus::Pending), 513);
    }

    #[tokio::test]
    async fn zero_resolved_devices_is_rejected() {
        let h = harness().await;
        Mock::given(method("POST"))
            .and(path_regex("^/api/internal/v2/inventory/.*"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Total-Count", "0")
                    .set_body_json(json!([])),
            )
            .mount(&h.server)
            .await;

        let err = h
            .engine
            .create_deployment(
                &tenant(),
                DeploymentConstructor {
                    name: "empty".into(),
                    artifact_name: "App123".into(),
                    all_devices: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoDevices));
    }

    #[tokio::test]
    async fn constructor_validation_is_surfaced() {
        let h = harness().await;
        let err = h
            .engine
            .create_deployment(
                &tenant(),
                DeploymentConstructor {
                    name: "bad".into(),
                    artifact_name: "App123".into(),
                    devices: vec![DeviceId::new("d1")],
                    all_devices: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    // ── Decommission ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn decommission_terminates_and_prunes_history() {
        let h = harness().await;
        let d1 = explicit_deployment(&h, "App123", &["d1", "d2"]).await;

        h.engine
            .decommission_device(&tenant(), &DeviceId::new("d1"))
            .await
            .unwrap();

        let d1 = h.engine.get_deployment(&tenant(), d1.id).await.unwrap();
        assert_eq!(d1.stats.get(DeviceDeploymentStatus::Decommissioned), 1);
        assert_eq!(d1.stats.get(DeviceDeploymentStatus::Pending), 1);

        // History is soft-deleted: nothing visible, nothing pollable.
        let rows = h
            .store
            .find_device_deployments_for_device(
                &tenant(),
                &DeviceId::new("d1"),
                None,
                false,
                0,
                0,
            )
            .await
            .unwrap();
        assert!(rows.is_empty());

        // Re-running the sweep changes nothing.
        h.engine
            .decommission_device(&tenant(), &DeviceId::new("d1"))
            .await
            .unwrap();
        let again = h.engine.get_deployment(&tenant(), d1.id).await.unwrap();
        assert_eq!(again.stats, d1.stats);
    }

    // ── Upload lifecycle ─────────────────────────────────────────────────

    #[tokio::test]
    async fn upload_stage_commit_complete() {
        let h = harness().await;
        let intent = h
            .engine
            .stage_upload(&tenant(), Duration::from_secs(900))
            .await
            .unwrap();
        assert_eq!(intent.status, IntentStatus::PENDING);
        let link = intent.link.clone().unwrap();
        assert_eq!(link.method, "PUT");
        assert!(link.uri.contains(&format!("{}.part", intent.id)));

        h.engine
            .commit_upload(
                &tenant(),
                intent.id,
                CommitUpload {
                    artifact_name: "App123".into(),
                    device_types: vec!["hammer".into()],
                },
            )
            .await
            .unwrap();
        let stored = h
            .store
            .get_upload_intent(&tenant(), intent.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status.base(), LinkStatus::Processing);

        // Double-commit conflicts.
        assert!(matches!(
            h.engine
                .commit_upload(
                    &tenant(),
                    intent.id,
                    CommitUpload {
                        artifact_name: "App123".into(),
                        device_types: vec!["hammer".into()],
                    },
                )
                .await,
            Err(EngineError::Conflict(_))
        ));

        let image = h
            .engine
            .complete_upload(
                &tenant(),
                intent.id,
                new_image("App123", &["hammer"], 2048, None),
            )
            .await
            .unwrap();
        assert_eq!(image.id, intent.id);
        let stored = h
            .store
            .get_upload_intent(&tenant(), intent.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status.base(), LinkStatus::Completed);
        assert!(h.engine.get_image(&tenant(), intent.id).await.is_ok());
    }

    #[tokio::test]
    async fn failed_workflow_start_aborts_the_intent() {
        let h = harness().await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/workflow/generate_artifact"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        // Engine with a broken workflows service but the same store.
        let engine = Engine::new(
            h.store.clone(),
            h.engine.objstore.clone(),
            InventoryClient::new(server.uri()),
            WorkflowsClient::new(server.uri()),
            EngineConfig::default(),
        );

        let intent = engine
            .stage_upload(&tenant(), Duration::from_secs(900))
            .await
            .unwrap();
        let err = engine
            .commit_upload(
                &tenant(),
                intent.id,
                CommitUpload {
                    artifact_name: "App123".into(),
                    device_types: vec!["hammer".into()],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Upstream(_)));
        let stored = h
            .store
            .get_upload_intent(&tenant(), intent.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status.base(), LinkStatus::Aborted);
    }

    #[tokio::test]
    async fn storage_limit_blocks_staging() {
        let h = harness().await;
        h.store
            .set_storage_limit(&tenant(), Some(1024))
            .await
            .unwrap();
        h.engine
            .create_image(&tenant(), new_image("App123", &["hammer"], 4096, None))
            .await
            .unwrap();
        assert!(matches!(
            h.engine.stage_upload(&tenant(), Duration::from_secs(60)).await,
            Err(EngineError::Conflict(_))
        ));
    }

    // ── Seed scenario 3: reaper single-shot ──────────────────────────────

    #[tokio::test]
    async fn reaper_single_shot_reclaims_expired_intents() {
        let h = harness().await;
        let now = Utc::now();
        let link = UploadLink {
            uri: "https://example.com/upload".into(),
            method: "PUT".into(),
            expire: now,
            headers: HashMap::new(),
        };

        // I1: completed one hour ago, cleanup owed.
        let mut i1 = UploadIntent::new(ImageId::generate(), tenant(), link.clone(), now);
        i1.status = IntentStatus::COMPLETED;
        i1.updated = now - chrono::Duration::hours(1);
        // I2: pending for twelve hours, client walked away.
        let mut i2 = UploadIntent::new(ImageId::generate(), tenant(), link.clone(), now);
        i2.updated = now - chrono::Duration::hours(12);
        // I3: processing three times the idle threshold.
        let mut i3 = UploadIntent::new(ImageId::generate(), tenant(), link, now);
        i3.status = IntentStatus::PROCESSING;
        i3.updated = now - chrono::Duration::hours(3);
        for intent in [&i1, &i2, &i3] {
            h.store.insert_upload_intent(intent).await.unwrap();
        }

        let reaper = UploadReaper::new(
            h.engine.clone(),
            Duration::ZERO, // single-shot
            Duration::from_secs(600),
            Duration::from_secs(3600),
        );
        let (_tx, rx) = tokio::sync::watch::channel(false);
        reaper.run(rx.clone()).await.unwrap();

        let s1 = h.store.get_upload_intent(&tenant(), i1.id).await.unwrap().unwrap();
        assert_eq!(s1.status.base(), LinkStatus::Completed);
        assert!(s1.status.processed());
        let s2 = h.store.get_upload_intent(&tenant(), i2.id).await.unwrap().unwrap();
        assert_eq!(s2.status.base(), LinkStatus::Aborted);
        assert!(s2.status.processed());
        let s3 = h.store.get_upload_intent(&tenant(), i3.id).await.unwrap().unwrap();
        assert_eq!(s3.status.base(), LinkStatus::Pending);
        assert!(!s3.status.processed());

        let deletes = |reqs: &[wiremock::Request]| {
            reqs.iter()
                .filter(|r| r.method.as_str() == "DELETE")
                .count()
        };
        let received = h.server.received_requests().await.unwrap();
        assert_eq!(deletes(&received), 2, "objects deleted for I1 and I2 only");

        // Second run without new events: no further side effects.
        let reaper = UploadReaper::new(
            h.engine.clone(),
            Duration::ZERO,
            Duration::from_secs(600),
            Duration::from_secs(3600),
        );
        reaper.run(rx).await.unwrap();
        let received = h.server.received_requests().await.unwrap();
        assert_eq!(deletes(&received), 2);
        let s3 = h.store.get_upload_intent(&tenant(), i3.id).await.unwrap().unwrap();
        assert_eq!(s3.status.base(), LinkStatus::Pending);
    }

    // ── Seed scenario 6: periodic reaper cancellation ────────────────────

    #[tokio::test]
    async fn periodic_reaper_returns_cancel_cause() {
        let h = harness().await;
        let reaper = UploadReaper::new(
            h.engine.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(600),
            Duration::from_secs(3600),
        );
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move { reaper.run(rx).await });

        // Let the first (empty) sweep happen, then cancel.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper exits promptly")
            .unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    // ── Catalog ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn artifact_uniqueness_check() {
        let h = harness().await;
        h.engine
            .create_image(&tenant(), new_image("App123", &["hammer"], 1024, Some(("variant", "a"))))
            .await
            .unwrap();

        // The existing candidate has non-trivial depends, so the name and
        // device type may be reused.
        assert!(h
            .engine
            .is_artifact_unique(&tenant(), "App123", &["hammer".into()])
            .await
            .unwrap());

        h.engine
            .create_image(&tenant(), new_image("Plain", &["hammer"], 1024, None))
            .await
            .unwrap();
        assert!(!h
            .engine
            .is_artifact_unique(&tenant(), "Plain", &["hammer".into()])
            .await
            .unwrap());
        // Disjoint device types never clash.
        assert!(h
            .engine
            .is_artifact_unique(&tenant(), "Plain", &["anvil".into()])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn image_delete_guarded_by_active_deployments() {
        let h = harness().await;
        let image = h
            .engine
            .create_image(&tenant(), new_image("App123", &["hammer"], 1024, None))
            .await
            .unwrap();
        let dep = explicit_deployment(&h, "App123", &["d1"]).await;
        assert!(dep.artifacts.contains(&image.id));

        assert!(matches!(
            h.engine.delete_image(&tenant(), image.id).await,
            Err(EngineError::Conflict(_))
        ));

        h.engine.abort_deployment(&tenant(), dep.id).await.unwrap();
        h.engine.delete_image(&tenant(), image.id).await.unwrap();
        assert!(matches!(
            h.engine.get_image(&tenant(), image.id).await,
            Err(EngineError::NotFound)
        ));
        // Last image gone: the release evaporates with it.
        assert!(h
            .engine
            .list_releases(&tenant(), &Default::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn device_log_round_trip() {
        let h = harness().await;
        let dep = explicit_deployment(&h, "App123", &["d1"]).await;
        let dev = DeviceId::new("d1");

        assert!(matches!(
            h.engine.save_device_log(&tenant(), dep.id, &dev, vec![]).await,
            Err(EngineError::InvalidInput(_))
        ));

        h.engine
            .save_device_log(
                &tenant(),
                dep.id,
                &dev,
                vec![LogMessage {
                    timestamp: Utc::now(),
                    level: "info".into(),
                    message: "installing".into(),
                }],
            )
            .await
            .unwrap();
        let log = h.engine.get_device_log(&tenant(), dep.id, &dev).await.unwrap();
        assert_eq!(log.messages.len(), 1);
        let dd = h
            .store
            .get_device_deployment(&tenant(), dep.id, &dev)
            .await
            .unwrap()
            .unwrap();
        assert!(dd.log_available);
    }

    #[tokio::test]
    async fn recalculate_stats_repairs_drift() {
        let h = harness().await;
        let dep = explicit_deployment(&h, "App123", &["d1", "d2"]).await;
        h.engine
            .update_device_status(
                &tenant(),
                dep.id,
                &DeviceId::new("d1"),
                DeviceDeploymentStatus::Success,
                None,
            )
            .await
            .unwrap();

        // Inject drift, then repair.
        h.store
            .set_deployment_stats(&tenant(), dep.id, Stats::with_pending(9), Utc::now())
            .await
            .unwrap();
        let repaired = h.engine.recalculate_stats(&tenant(), dep.id).await.unwrap();
        assert_eq!(repaired.stats.get(DeviceDeploymentStatus::Success), 1);
        assert_eq!(repaired.stats.get(DeviceDeploymentStatus::Pending), 1);
        assert_eq!(repaired.stats.total(), 2);
    }
}
