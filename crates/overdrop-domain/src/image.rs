use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::types::ImageId;

pub const MAX_TAGS_PER_RELEASE: usize = 20;
pub const MAX_UNIQUE_TAGS_PER_TENANT: usize = 100;
pub const MAX_TAG_LEN: usize = 1024;

// ── Artifact metadata ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub format: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFile {
    pub name: String,
    pub checksum: String,
    pub size: i64,
}

/// One update payload inside an artifact, as reported by the artifact reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Update type, e.g. `rootfs-image`.
    #[serde(rename = "type")]
    pub type_info: String,
    #[serde(default)]
    pub files: Vec<PayloadFile>,
}

// ── Depends index ────────────────────────────────────────────────────────────

/// One point of an artifact's depends cross-product: every array value
/// pinned to a single scalar. Ordered keys make tuples comparable.
pub type DependsTuple = BTreeMap<String, String>;

fn scalar_values(v: &Value) -> Vec<String> {
    match v {
        Value::Array(items) => items.iter().flat_map(scalar_values).collect(),
        Value::String(s) => vec![s.clone()],
        Value::Null => vec![],
        other => vec![other.to_string()],
    }
}

/// Enumerate the cross-product of array-valued depends as ordered key-value
/// tuples. An empty depends map yields one empty tuple (the wildcard).
pub fn depends_index(depends: &HashMap<String, Value>) -> Vec<DependsTuple> {
    let mut tuples: Vec<DependsTuple> = vec![DependsTuple::new()];
    let keys: BTreeSet<&String> = depends.keys().collect();
    for key in keys {
        let values = scalar_values(&depends[key]);
        if values.is_empty() {
            continue;
        }
        let mut next = Vec::with_capacity(tuples.len() * values.len());
        for tuple in &tuples {
            for value in &values {
                let mut t = tuple.clone();
                t.insert(key.clone(), value.clone());
                next.push(t);
            }
        }
        tuples = next;
    }
    tuples
}

/// Whether two index tuples can both match some device. A key missing on
/// either side is a wildcard; only a key present on both sides with
/// different values keeps the tuples apart.
pub fn depends_overlap(a: &DependsTuple, b: &DependsTuple) -> bool {
    a.iter()
        .all(|(k, v)| b.get(k).map_or(true, |other| other == v))
}

/// Whether a device satisfies an artifact's depends: every key must be
/// present in the device-reported provides, and array values match if any
/// element matches.
pub fn depends_satisfied(
    depends: &HashMap<String, Value>,
    provides: &HashMap<String, String>,
) -> bool {
    depends.iter().all(|(key, want)| match provides.get(key) {
        None => false,
        Some(have) => scalar_values(want).iter().any(|v| v == have),
    })
}

// ── Image ────────────────────────────────────────────────────────────────────

/// An artifact in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    #[serde(default)]
    pub description: String,
    /// Artifact name. Images sharing a name form a release.
    pub name: String,
    /// Compatible device types. Never empty.
    pub device_types: Vec<String>,
    pub info: ArtifactInfo,
    pub signed: bool,
    #[serde(default)]
    pub updates: Vec<Payload>,
    /// Facts the artifact installs.
    #[serde(default)]
    pub provides: HashMap<String, String>,
    /// Facts the device must satisfy. Values may be arrays (any-of).
    #[serde(default)]
    pub depends: HashMap<String, Value>,
    /// Enumerated cross-product of `depends`, used by the uniqueness index.
    #[serde(default)]
    pub depends_idx: Vec<DependsTuple>,
    pub size: i64,
    pub modified: DateTime<Utc>,
}

impl Image {
    /// Build an image, computing the depends index. Fails on an empty
    /// device-type set or an empty name.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ImageId,
        name: impl Into<String>,
        description: impl Into<String>,
        device_types: Vec<String>,
        info: ArtifactInfo,
        signed: bool,
        updates: Vec<Payload>,
        provides: HashMap<String, String>,
        depends: HashMap<String, Value>,
        size: i64,
        modified: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DomainError::InvalidArtifactName);
        }
        if device_types.is_empty() || device_types.iter().any(|t| t.is_empty()) {
            return Err(DomainError::EmptyDeviceTypes);
        }
        let depends_idx = depends_index(&depends);
        Ok(Image {
            id,
            description: description.into(),
            name,
            device_types,
            info,
            signed,
            updates,
            provides,
            depends,
            depends_idx,
            size,
            modified,
        })
    }

    pub fn supports_device_type(&self, device_type: &str) -> bool {
        self.device_types.iter().any(|t| t == device_type)
    }

    /// True when the artifact targets devices by something beyond the
    /// device type. Trivial-depends artifacts are the ones the uniqueness
    /// check rejects as name/device-type duplicates.
    pub fn has_non_trivial_depends(&self) -> bool {
        self.depends.keys().any(|k| k != "device_type")
    }
}

// ── Tags ─────────────────────────────────────────────────────────────────────

/// A release tag: lowercased on parse, `[a-z0-9_.-]+`, at most 1024 chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Tag {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let s = s.to_lowercase();
        if s.is_empty() || s.len() > MAX_TAG_LEN {
            return Err(DomainError::InvalidTag(s));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
        {
            return Err(DomainError::InvalidTag(s));
        }
        Ok(Tag(s))
    }
}

impl TryFrom<&str> for Tag {
    type Error = DomainError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Tag::try_from(s.to_string())
    }
}

impl From<Tag> for String {
    fn from(t: Tag) -> String {
        t.0
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Release ──────────────────────────────────────────────────────────────────

/// The set of images sharing an artifact name. Derived view: exists iff at
/// least one such image exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub modified: DateTime<Utc>,
    pub artifacts: Vec<Image>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub notes: String,
}

impl Release {
    /// Assemble a release from its images. `images` must be non-empty and
    /// share one name.
    pub fn from_images(mut images: Vec<Image>, tags: Vec<Tag>, notes: String) -> Option<Release> {
        let name = images.first()?.name.clone();
        images.sort_by(|a, b| a.modified.cmp(&b.modified));
        let modified = images.iter().map(|i| i.modified).max()?;
        Some(Release {
            name,
            modified,
            artifacts: images,
            tags,
            notes,
        })
    }

    /// Distinct update types across the release's artifacts.
    pub fn update_types(&self) -> Vec<String> {
        let mut types: BTreeSet<String> = BTreeSet::new();
        for image in &self.artifacts {
            for payload in &image.updates {
                types.insert(payload.type_info.clone());
            }
        }
        types.into_iter().collect()
    }
}
