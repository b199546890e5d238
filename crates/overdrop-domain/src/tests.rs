#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use serde_json::json;

    use crate::deployment::*;
    use crate::image::*;
    use crate::types::*;
    use crate::upload::*;

    #[test]
    fn active_statuses_are_contiguous() {
        let active: Vec<u8> = DeviceDeploymentStatus::ALL
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.as_u8())
            .collect();
        assert_eq!(active, vec![3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(active[0], DeviceDeploymentStatus::ACTIVE_LOW);
        assert_eq!(*active.last().unwrap(), DeviceDeploymentStatus::ACTIVE_HIGH);
    }

    #[test]
    fn status_text_round_trips() {
        for status in DeviceDeploymentStatus::ALL {
            let parsed: DeviceDeploymentStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
            assert_eq!(DeviceDeploymentStatus::from_u8(status.as_u8()), Some(status));
        }
        assert_eq!(
            DeviceDeploymentStatus::AlreadyInstalled.as_str(),
            "already-installed"
        );
        assert_eq!(DeviceDeploymentStatus::NoArtifact.as_str(), "noartifact");
    }

    #[test]
    fn terminal_statuses_reject_nothing_by_encoding() {
        for status in DeviceDeploymentStatus::ALL {
            assert_eq!(status.is_terminal(), !status.is_active());
        }
        assert!(DeviceDeploymentStatus::PauseBeforeCommit.is_paused());
        assert!(!DeviceDeploymentStatus::Downloading.is_paused());
    }

    #[test]
    fn stats_apply_moves_one_counter() {
        let mut stats = Stats::with_pending(3);
        stats.apply(
            Some(DeviceDeploymentStatus::Pending),
            DeviceDeploymentStatus::Downloading,
        );
        assert_eq!(stats.get(DeviceDeploymentStatus::Pending), 2);
        assert_eq!(stats.get(DeviceDeploymentStatus::Downloading), 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn deployment_status_derivation() {
        // Pending: only pending counters.
        let stats = Stats::with_pending(2);
        assert_eq!(stats.deployment_status(false, 2), DeploymentStatus::Pending);

        // InProgress: any non-pending counter, not everything terminal.
        let mut stats = Stats::with_pending(2);
        stats.apply(
            Some(DeviceDeploymentStatus::Pending),
            DeviceDeploymentStatus::Installing,
        );
        assert_eq!(
            stats.deployment_status(false, 2),
            DeploymentStatus::InProgress
        );

        // Finished: terminal counters cover max_devices.
        let mut stats = Stats::new();
        stats.set(DeviceDeploymentStatus::Success, 1);
        stats.set(DeviceDeploymentStatus::Failure, 1);
        assert_eq!(stats.deployment_status(false, 2), DeploymentStatus::Finished);

        // Finished timestamp wins regardless of counters.
        let stats = Stats::with_pending(5);
        assert_eq!(stats.deployment_status(true, 5), DeploymentStatus::Finished);

        // Zero max-devices never finishes on counters alone.
        let stats = Stats::new();
        assert_eq!(stats.deployment_status(false, 0), DeploymentStatus::Pending);
    }

    #[test]
    fn depends_index_cross_product() {
        let mut depends = HashMap::new();
        depends.insert("checksum".to_string(), json!(["a", "b"]));
        depends.insert("variant".to_string(), json!(["x", "y"]));
        let idx = depends_index(&depends);
        assert_eq!(idx.len(), 4);
        assert!(idx
            .iter()
            .any(|t| t["checksum"] == "a" && t["variant"] == "y"));
    }

    #[test]
    fn depends_index_of_empty_map_is_wildcard() {
        let idx = depends_index(&HashMap::new());
        assert_eq!(idx.len(), 1);
        assert!(idx[0].is_empty());
    }

    #[test]
    fn depends_overlap_treats_missing_keys_as_wildcard() {
        let mut a = DependsTuple::new();
        a.insert("checksum".into(), "a".into());
        let b = DependsTuple::new();
        assert!(depends_overlap(&a, &b));
        assert!(depends_overlap(&b, &a));

        let mut c = DependsTuple::new();
        c.insert("checksum".into(), "b".into());
        assert!(!depends_overlap(&a, &c));

        // Disjoint keys overlap: each side wildcards the other's key.
        let mut d = DependsTuple::new();
        d.insert("variant".into(), "x".into());
        assert!(depends_overlap(&a, &d));
    }

    #[test]
    fn depends_satisfied_matches_any_array_element() {
        let mut depends = HashMap::new();
        depends.insert("rootfs".to_string(), json!(["v1", "v2"]));
        let mut provides = HashMap::new();
        provides.insert("rootfs".to_string(), "v2".to_string());
        assert!(depends_satisfied(&depends, &provides));

        provides.insert("rootfs".to_string(), "v3".to_string());
        assert!(!depends_satisfied(&depends, &provides));

        // Missing key fails outright.
        assert!(!depends_satisfied(&depends, &HashMap::new()));
    }

    #[test]
    fn tag_is_lowercased_and_validated() {
        let tag = Tag::try_from("Stable-1.0").unwrap();
        assert_eq!(tag.as_str(), "stable-1.0");
        assert!(Tag::try_from("").is_err());
        assert!(Tag::try_from("no spaces").is_err());
        assert!(Tag::try_from("x".repeat(1025)).is_err());
    }

    #[test]
    fn constructor_requires_exactly_one_selector() {
        let base = DeploymentConstructor {
            name: "rollout".into(),
            artifact_name: "App123".into(),
            ..Default::default()
        };
        assert!(base.validate().is_err());

        let devices = DeploymentConstructor {
            devices: vec![DeviceId::new("d1")],
            ..base.clone()
        };
        assert!(devices.validate().is_ok());

        let conflicting = DeploymentConstructor {
            devices: vec![DeviceId::new("d1")],
            all_devices: true,
            ..base.clone()
        };
        assert!(conflicting.validate().is_err());

        let empty_group = DeploymentConstructor {
            group: Some(String::new()),
            ..base.clone()
        };
        assert!(empty_group.validate().is_err());

        let long_name = DeploymentConstructor {
            name: "x".repeat(4097),
            devices: vec![DeviceId::new("d1")],
            ..base
        };
        assert!(long_name.validate().is_err());
    }

    #[test]
    fn intent_status_preserves_processed_bit() {
        let s = IntentStatus::PENDING;
        assert!(!s.processed());
        let s = s.with_processed();
        assert!(s.processed());
        assert_eq!(s.base(), LinkStatus::Pending);

        // Rebasing keeps the bit; re-marking keeps the base.
        let s = s.with_base(LinkStatus::Aborted);
        assert!(s.processed());
        assert_eq!(s.base(), LinkStatus::Aborted);
        assert_eq!(s.to_string(), "aborted+processed");

        let parsed: IntentStatus = "aborted+processed".parse().unwrap();
        assert_eq!(parsed, s);
        let parsed: IntentStatus = "processing".parse().unwrap();
        assert_eq!(parsed, IntentStatus::PROCESSING);
        assert_eq!(IntentStatus::from_u8(s.as_u8()), Some(s));
    }

    #[test]
    fn device_deployment_terminal_stamp() {
        let now = Utc::now();
        let mut dd = DeviceDeployment::new(DeploymentId::generate(), DeviceId::new("d1"), now);
        assert!(dd.active);
        assert!(dd.finished.is_none());

        dd.set_status(DeviceDeploymentStatus::Downloading, now);
        assert!(dd.active);
        assert!(dd.finished.is_none());

        dd.set_status(DeviceDeploymentStatus::Success, now);
        assert!(!dd.active);
        assert_eq!(dd.finished, Some(now));
    }

    #[test]
    fn substate_is_truncated() {
        let now = Utc::now();
        let mut dd = DeviceDeployment::new(DeploymentId::generate(), DeviceId::new("d1"), now);
        dd.set_substate(Some("y".repeat(300)));
        assert_eq!(dd.substate.as_ref().unwrap().len(), MAX_SUBSTATE_LEN);
    }

    #[test]
    fn image_rejects_empty_device_types() {
        let err = Image::new(
            ImageId::generate(),
            "App123",
            "",
            vec![],
            ArtifactInfo {
                format: "overdrop".into(),
                version: 3,
            },
            false,
            vec![],
            HashMap::new(),
            HashMap::new(),
            1024,
            Utc::now(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn release_update_types_are_distinct_and_sorted() {
        let mk = |name: &str, type_info: &str| {
            Image::new(
                ImageId::generate(),
                name,
                "",
                vec!["hammer".into()],
                ArtifactInfo {
                    format: "overdrop".into(),
                    version: 3,
                },
                false,
                vec![Payload {
                    type_info: type_info.into(),
                    files: vec![],
                }],
                HashMap::new(),
                HashMap::new(),
                1024,
                Utc::now(),
            )
            .unwrap()
        };
        let release = Release::from_images(
            vec![
                mk("App123", "rootfs-image"),
                mk("App123", "app-image"),
                mk("App123", "rootfs-image"),
            ],
            vec![],
            String::new(),
        )
        .unwrap();
        assert_eq!(release.update_types(), vec!["app-image", "rootfs-image"]);
    }
}
