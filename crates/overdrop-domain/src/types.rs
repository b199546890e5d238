use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Isolation boundary for every record and object path.
///
/// The empty tenant means single-tenant mode: object paths drop the tenant
/// segment and the store keeps a single namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Tenant(pub String);

impl Tenant {
    pub fn new(s: impl Into<String>) -> Self {
        Tenant(s.into())
    }

    /// The single-tenant namespace.
    pub fn single() -> Self {
        Tenant(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_single(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                $name(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s).map($name)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of an artifact in the catalog. Also names the object in the
    /// object store (`{tenant}/{id}` once committed).
    ImageId
);
uuid_id!(DeploymentId);
uuid_id!(DeviceDeploymentId);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(s: impl Into<String>) -> Self {
        DeviceId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Device-deployment status ─────────────────────────────────────────────────

/// Status of one device's slot in a deployment.
///
/// The integer encoding is stable and storage-visible: the active statuses
/// occupy the contiguous range `3..=9` so the store can filter active work
/// with a single range predicate on the indexed column. The wire marshals
/// text; storage uses the integer. Never reorder these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceDeploymentStatus {
    #[serde(rename = "failure")]
    Failure = 1,
    #[serde(rename = "aborted")]
    Aborted = 2,
    #[serde(rename = "pause_before_install")]
    PauseBeforeInstall = 3,
    #[serde(rename = "pause_before_commit")]
    PauseBeforeCommit = 4,
    #[serde(rename = "pause_before_reboot")]
    PauseBeforeReboot = 5,
    #[serde(rename = "downloading")]
    Downloading = 6,
    #[serde(rename = "installing")]
    Installing = 7,
    #[serde(rename = "rebooting")]
    Rebooting = 8,
    #[serde(rename = "pending")]
    Pending = 9,
    #[serde(rename = "success")]
    Success = 10,
    #[serde(rename = "noartifact")]
    NoArtifact = 11,
    #[serde(rename = "already-installed")]
    AlreadyInstalled = 12,
    #[serde(rename = "decommissioned")]
    Decommissioned = 13,
}

impl DeviceDeploymentStatus {
    pub const ACTIVE_LOW: u8 = DeviceDeploymentStatus::PauseBeforeInstall as u8;
    pub const ACTIVE_HIGH: u8 = DeviceDeploymentStatus::Pending as u8;

    /// All statuses, in encoding order.
    pub const ALL: [DeviceDeploymentStatus; 13] = [
        DeviceDeploymentStatus::Failure,
        DeviceDeploymentStatus::Aborted,
        DeviceDeploymentStatus::PauseBeforeInstall,
        DeviceDeploymentStatus::PauseBeforeCommit,
        DeviceDeploymentStatus::PauseBeforeReboot,
        DeviceDeploymentStatus::Downloading,
        DeviceDeploymentStatus::Installing,
        DeviceDeploymentStatus::Rebooting,
        DeviceDeploymentStatus::Pending,
        DeviceDeploymentStatus::Success,
        DeviceDeploymentStatus::NoArtifact,
        DeviceDeploymentStatus::AlreadyInstalled,
        DeviceDeploymentStatus::Decommissioned,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_u8() == v)
    }

    pub fn is_active(self) -> bool {
        let v = self.as_u8();
        (Self::ACTIVE_LOW..=Self::ACTIVE_HIGH).contains(&v)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn is_paused(self) -> bool {
        matches!(
            self,
            DeviceDeploymentStatus::PauseBeforeInstall
                | DeviceDeploymentStatus::PauseBeforeCommit
                | DeviceDeploymentStatus::PauseBeforeReboot
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceDeploymentStatus::Failure => "failure",
            DeviceDeploymentStatus::Aborted => "aborted",
            DeviceDeploymentStatus::PauseBeforeInstall => "pause_before_install",
            DeviceDeploymentStatus::PauseBeforeCommit => "pause_before_commit",
            DeviceDeploymentStatus::PauseBeforeReboot => "pause_before_reboot",
            DeviceDeploymentStatus::Downloading => "downloading",
            DeviceDeploymentStatus::Installing => "installing",
            DeviceDeploymentStatus::Rebooting => "rebooting",
            DeviceDeploymentStatus::Pending => "pending",
            DeviceDeploymentStatus::Success => "success",
            DeviceDeploymentStatus::NoArtifact => "noartifact",
            DeviceDeploymentStatus::AlreadyInstalled => "already-installed",
            DeviceDeploymentStatus::Decommissioned => "decommissioned",
        }
    }
}

impl std::fmt::Display for DeviceDeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeviceDeploymentStatus {
    type Err = crate::error::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| crate::error::DomainError::InvalidStatus(s.to_string()))
    }
}

// ── Deployment status ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "inprogress")]
    InProgress,
    #[serde(rename = "finished")]
    Finished,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::InProgress => "inprogress",
            DeploymentStatus::Finished => "finished",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = crate::error::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "inprogress" => Ok(DeploymentStatus::InProgress),
            "finished" => Ok(DeploymentStatus::Finished),
            other => Err(crate::error::DomainError::InvalidStatus(other.to_string())),
        }
    }
}

// ── Stats ────────────────────────────────────────────────────────────────────

/// Per-deployment counters keyed by device-deployment status text.
///
/// The key set is closed (the 13 statuses); absent keys read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stats(pub BTreeMap<String, u32>);

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    /// Stats of a freshly planned deployment: everything pending.
    pub fn with_pending(n: u32) -> Self {
        let mut s = Stats::new();
        s.set(DeviceDeploymentStatus::Pending, n);
        s
    }

    pub fn get(&self, status: DeviceDeploymentStatus) -> u32 {
        self.0.get(status.as_str()).copied().unwrap_or(0)
    }

    pub fn set(&mut self, status: DeviceDeploymentStatus, count: u32) {
        if count == 0 {
            self.0.remove(status.as_str());
        } else {
            self.0.insert(status.as_str().to_string(), count);
        }
    }

    pub fn inc(&mut self, status: DeviceDeploymentStatus) {
        let v = self.get(status);
        self.set(status, v + 1);
    }

    pub fn dec(&mut self, status: DeviceDeploymentStatus) {
        let v = self.get(status);
        self.set(status, v.saturating_sub(1));
    }

    /// Apply one transition: `stats[from]--, stats[to]++`. `from == None`
    /// increments only.
    pub fn apply(&mut self, from: Option<DeviceDeploymentStatus>, to: DeviceDeploymentStatus) {
        if let Some(from) = from {
            self.dec(from);
        }
        self.inc(to);
    }

    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }

    pub fn terminal_total(&self) -> u32 {
        DeviceDeploymentStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| self.get(*s))
            .sum()
    }

    /// True when any counter outside `pending` is non-zero.
    pub fn any_non_pending(&self) -> bool {
        DeviceDeploymentStatus::ALL
            .iter()
            .filter(|s| **s != DeviceDeploymentStatus::Pending)
            .any(|s| self.get(*s) > 0)
    }

    /// Derive the deployment lifecycle state from the counters.
    ///
    /// Finished wins when the finished timestamp is already set, or once
    /// every enrolled device reached a terminal status.
    pub fn deployment_status(&self, finished: bool, max_devices: u32) -> DeploymentStatus {
        if finished || (max_devices > 0 && self.terminal_total() >= max_devices) {
            DeploymentStatus::Finished
        } else if self.any_non_pending() {
            DeploymentStatus::InProgress
        } else {
            DeploymentStatus::Pending
        }
    }
}

// ── Device poll input ────────────────────────────────────────────────────────

/// What the device reports about itself when polling for work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledArtifact {
    pub artifact_name: String,
    pub device_type: String,
    /// Facts published by the currently installed artifact.
    #[serde(default)]
    pub provides: HashMap<String, String>,
}
