//! Serde-facing structs for the YAML config file. Converted to the typed
//! [`Config`](crate::loader::Config) by the loader.

use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    /// Listen address, e.g. `0.0.0.0:8080`.
    pub listen: Option<String>,
    pub auth_token: Option<String>,
    /// Path of the embedded database file. Absent means in-memory.
    pub store_path: Option<String>,
    #[serde(default)]
    pub storage: Option<RawStorage>,
    #[serde(default)]
    pub services: RawServices,
    #[serde(default)]
    pub reaper: RawReaper,
    #[serde(default)]
    pub engine: RawEngine,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawStorage {
    pub provider: String,
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub external_endpoint: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub use_accelerate: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawServices {
    pub inventory_url: Option<String>,
    pub workflows_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawReaper {
    /// Tick period in seconds; 0 turns `overdrop sweep` semantics on.
    pub interval_seconds: Option<u64>,
    /// Intents updated within this window are never swept.
    pub jitter_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawEngine {
    pub max_attempts: Option<u32>,
}
