use serde::{Deserialize, Serialize};

use crate::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    S3,
    Azure,
}

impl std::fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageProvider::S3 => write!(f, "s3"),
            StorageProvider::Azure => write!(f, "azure"),
        }
    }
}

/// Per-tenant object-store configuration. Either stored per tenant in the
/// metadata store or inherited from process-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StorageSettings {
    pub provider: StorageProvider,
    /// S3 bucket or Azure container.
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    /// Endpoint used for direct calls from inside the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Endpoint baked into presigned URLs handed to devices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_endpoint: Option<String>,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub secret: String,
    /// Azure alternative to key+secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    /// Optional STS session token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub use_accelerate: bool,
}

impl StorageSettings {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.bucket.is_empty() {
            return Err(DomainError::InvalidSettings("bucket must not be empty".into()));
        }
        match self.provider {
            StorageProvider::S3 => {
                if self.key.is_empty() || self.secret.is_empty() {
                    return Err(DomainError::InvalidSettings(
                        "s3 storage requires key and secret".into(),
                    ));
                }
                if self.force_path_style && self.use_accelerate {
                    return Err(DomainError::InvalidSettings(
                        "accelerate cannot be combined with path-style addressing".into(),
                    ));
                }
            }
            StorageProvider::Azure => {
                let has_shared_key = !self.key.is_empty() && !self.secret.is_empty();
                if !has_shared_key && self.connection_string.is_none() {
                    return Err(DomainError::InvalidSettings(
                        "azure storage requires a connection string or account key".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}
