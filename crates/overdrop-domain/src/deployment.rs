use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::types::{
    DeploymentId, DeploymentStatus, DeviceDeploymentId, DeviceDeploymentStatus, DeviceId,
    ImageId, InstalledArtifact, Stats,
};

pub const MAX_NAME_LEN: usize = 4096;
pub const MAX_SUBSTATE_LEN: usize = 200;

// ── Constructor ──────────────────────────────────────────────────────────────

/// User-supplied deployment request. Exactly one target selector must be
/// set: an explicit device list, `all_devices`, or a group name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeploymentConstructor {
    pub name: String,
    pub artifact_name: String,
    #[serde(default)]
    pub devices: Vec<DeviceId>,
    #[serde(default)]
    pub all_devices: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl DeploymentConstructor {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(DomainError::InvalidDeploymentName);
        }
        if self.artifact_name.is_empty() || self.artifact_name.len() > MAX_NAME_LEN {
            return Err(DomainError::InvalidArtifactName);
        }
        let selectors = [
            !self.devices.is_empty(),
            self.all_devices,
            self.group.is_some(),
        ];
        match selectors.iter().filter(|s| **s).count() {
            0 => Err(DomainError::NoTarget),
            1 => {
                if let Some(group) = &self.group {
                    if group.is_empty() {
                        return Err(DomainError::NoTarget);
                    }
                }
                if self.devices.iter().any(|d| d.as_str().is_empty()) {
                    return Err(DomainError::NoTarget);
                }
                Ok(())
            }
            _ => Err(DomainError::ConflictingTargets),
        }
    }
}

// ── Deployment ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeploymentType {
    #[default]
    #[serde(rename = "software")]
    Software,
    #[serde(rename = "configuration")]
    Configuration,
}

impl std::fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentType::Software => write!(f, "software"),
            DeploymentType::Configuration => write!(f, "configuration"),
        }
    }
}

/// A scheduled rollout of one artifact name to a set of devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub name: String,
    pub artifact_name: String,
    pub created: DateTime<Utc>,
    /// Set exactly when `status` becomes Finished.
    pub finished: Option<DateTime<Utc>>,
    /// Eligible artifact ids, resolved at creation.
    #[serde(default)]
    pub artifacts: Vec<ImageId>,
    pub stats: Stats,
    pub status: DeploymentStatus,
    /// Grows as device-deployment rows are enrolled.
    pub device_count: u32,
    /// Frozen size of the resolved target set.
    pub max_devices: u32,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Full device list for enumerable targets.
    #[serde(default)]
    pub device_list: Vec<DeviceId>,
    #[serde(rename = "type", default)]
    pub deployment_type: DeploymentType,
    /// Payload for configuration deployments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Value>,
}

impl Deployment {
    /// Materialise a deployment from a validated constructor and its
    /// resolved target set. Everything starts pending; device-count grows
    /// as rows are enrolled.
    pub fn from_constructor(
        constructor: &DeploymentConstructor,
        artifacts: Vec<ImageId>,
        devices: Vec<DeviceId>,
        now: DateTime<Utc>,
    ) -> Self {
        let max_devices = devices.len() as u32;
        Deployment {
            id: DeploymentId::generate(),
            name: constructor.name.clone(),
            artifact_name: constructor.artifact_name.clone(),
            created: now,
            finished: None,
            artifacts,
            stats: Stats::with_pending(max_devices),
            status: DeploymentStatus::Pending,
            device_count: 0,
            max_devices,
            groups: Vec::new(),
            device_list: devices,
            deployment_type: DeploymentType::Software,
            configuration: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status != DeploymentStatus::Finished
    }

    /// Recompute the lifecycle state from the current counters.
    pub fn compute_status(&self) -> DeploymentStatus {
        self.stats
            .deployment_status(self.finished.is_some(), self.max_devices)
    }
}

// ── Device-deployment ────────────────────────────────────────────────────────

/// One device's slot in a deployment: the unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDeployment {
    pub id: DeviceDeploymentId,
    pub deployment_id: DeploymentId,
    pub device_id: DeviceId,
    pub created: DateTime<Utc>,
    /// Stamped on the first poll.
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// Soft-delete marker, set when the device is decommissioned.
    pub deleted: Option<DateTime<Utc>>,
    pub status: DeviceDeploymentStatus,
    /// Assigned artifact. By id only; content never travels inline.
    pub image: Option<ImageId>,
    pub log_available: bool,
    /// Device-provided sub-state, truncated to [`MAX_SUBSTATE_LEN`].
    pub substate: Option<String>,
    /// The most recent poll request from the device.
    pub request: Option<InstalledArtifact>,
    pub attempts: u32,
    /// Mirrors `status.is_active()`. Kept in sync by [`set_status`].
    ///
    /// [`set_status`]: DeviceDeployment::set_status
    pub active: bool,
}

impl DeviceDeployment {
    pub fn new(deployment_id: DeploymentId, device_id: DeviceId, now: DateTime<Utc>) -> Self {
        DeviceDeployment {
            id: DeviceDeploymentId::generate(),
            deployment_id,
            device_id,
            created: now,
            started: None,
            finished: None,
            deleted: None,
            status: DeviceDeploymentStatus::Pending,
            image: None,
            log_available: false,
            substate: None,
            request: None,
            attempts: 0,
            active: true,
        }
    }

    /// The only place the status field changes: keeps `active` in sync and
    /// stamps `finished` on entry to a terminal status.
    pub fn set_status(&mut self, status: DeviceDeploymentStatus, now: DateTime<Utc>) {
        self.status = status;
        self.active = status.is_active();
        if status.is_terminal() && self.finished.is_none() {
            self.finished = Some(now);
        }
    }

    pub fn set_substate(&mut self, substate: Option<String>) {
        self.substate = substate.map(|mut s| {
            s.truncate(MAX_SUBSTATE_LEN);
            s
        });
    }
}

// ── Deployment log ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// Device-uploaded log for one device-deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentLog {
    pub deployment_id: DeploymentId,
    pub device_id: DeviceId,
    pub messages: Vec<LogMessage>,
}

impl DeploymentLog {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.messages.is_empty() {
            return Err(DomainError::EmptyLog);
        }
        Ok(())
    }
}
