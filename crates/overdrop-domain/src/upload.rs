use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::types::{ImageId, Tenant};

// ── Intent status ────────────────────────────────────────────────────────────

/// Base lifecycle of a staged upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkStatus {
    Pending = 1,
    Processing = 2,
    Completed = 3,
    Aborted = 4,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkStatus::Pending => "pending",
            LinkStatus::Processing => "processing",
            LinkStatus::Completed => "completed",
            LinkStatus::Aborted => "aborted",
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(LinkStatus::Pending),
            2 => Some(LinkStatus::Processing),
            3 => Some(LinkStatus::Completed),
            4 => Some(LinkStatus::Aborted),
            _ => None,
        }
    }
}

/// Four-value base status with an orthogonal `processed` bit, packed into
/// one byte. The bit records that reaper cleanup has run; every CAS that
/// changes the base must carry the bit through unchanged and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IntentStatus(u8);

const PROCESSED_BIT: u8 = 0x10;

impl IntentStatus {
    pub const PENDING: IntentStatus = IntentStatus(LinkStatus::Pending as u8);
    pub const PROCESSING: IntentStatus = IntentStatus(LinkStatus::Processing as u8);
    pub const COMPLETED: IntentStatus = IntentStatus(LinkStatus::Completed as u8);
    pub const ABORTED: IntentStatus = IntentStatus(LinkStatus::Aborted as u8);

    pub fn new(base: LinkStatus) -> Self {
        IntentStatus(base as u8)
    }

    pub fn base(self) -> LinkStatus {
        LinkStatus::from_u8(self.0 & !PROCESSED_BIT).expect("valid by construction")
    }

    pub fn processed(self) -> bool {
        self.0 & PROCESSED_BIT != 0
    }

    pub fn with_processed(self) -> Self {
        IntentStatus(self.0 | PROCESSED_BIT)
    }

    /// Replace the base status, preserving the processed bit.
    pub fn with_base(self, base: LinkStatus) -> Self {
        IntentStatus(base as u8 | (self.0 & PROCESSED_BIT))
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        LinkStatus::from_u8(v & !PROCESSED_BIT).map(|_| IntentStatus(v))
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.processed() {
            write!(f, "{}+processed", self.base().as_str())
        } else {
            write!(f, "{}", self.base().as_str())
        }
    }
}

impl std::str::FromStr for IntentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, processed) = match s.strip_suffix("+processed") {
            Some(base) => (base, true),
            None => (s, false),
        };
        let base = match base {
            "pending" => LinkStatus::Pending,
            "processing" => LinkStatus::Processing,
            "completed" => LinkStatus::Completed,
            "aborted" => LinkStatus::Aborted,
            other => return Err(DomainError::InvalidStatus(other.to_string())),
        };
        let status = IntentStatus::new(base);
        Ok(if processed {
            status.with_processed()
        } else {
            status
        })
    }
}

impl TryFrom<String> for IntentStatus {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IntentStatus> for String {
    fn from(s: IntentStatus) -> String {
        s.to_string()
    }
}

// ── Upload link ──────────────────────────────────────────────────────────────

/// External link metadata handed to the client for the staged PUT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadLink {
    pub uri: String,
    pub method: String,
    pub expire: DateTime<Utc>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

// ── Upload intent ────────────────────────────────────────────────────────────

/// Server-side record of a staged artifact upload. Reconciles the object
/// store with the metadata store when either side fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadIntent {
    /// The artifact id the upload will commit as.
    pub id: ImageId,
    pub tenant: Tenant,
    pub status: IntentStatus,
    pub issued: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<UploadLink>,
}

impl UploadIntent {
    pub fn new(id: ImageId, tenant: Tenant, link: UploadLink, now: DateTime<Utc>) -> Self {
        UploadIntent {
            id,
            tenant,
            status: IntentStatus::PENDING,
            issued: now,
            updated: now,
            link: Some(link),
        }
    }
}
