use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use overdrop_domain::{StorageProvider, StorageSettings};
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::{RawConfig, RawStorage};

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_REAPER_INTERVAL: u64 = 3600;
const DEFAULT_REAPER_JITTER: u64 = 600;
const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Fully validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub auth_token: String,
    /// Embedded database file; `None` runs on the in-memory store.
    pub store_path: Option<PathBuf>,
    /// Process-wide storage defaults; tenants may override via settings.
    pub storage: Option<StorageSettings>,
    pub inventory_url: String,
    pub workflows_url: String,
    pub reaper_interval: Duration,
    pub reaper_jitter: Duration,
    pub max_attempts: u32,
}

/// Load configuration: the YAML file (when given), then `OVERDROP_*`
/// environment overrides on top.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let raw = match path {
        Some(path) => {
            debug!("loading config from {}", path.display());
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            serde_yaml::from_str::<RawConfig>(&content).map_err(|e| ConfigError::YamlParse {
                path: path.display().to_string(),
                source: e,
            })?
        }
        None => RawConfig::default(),
    };
    convert(raw)
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn convert(raw: RawConfig) -> Result<Config, ConfigError> {
    let listen = env("OVERDROP_LISTEN")
        .or(raw.listen)
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let listen: SocketAddr = listen
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("listen address '{}' is malformed", listen)))?;

    let auth_token = env("OVERDROP_AUTH_TOKEN")
        .or(raw.auth_token)
        .ok_or_else(|| ConfigError::Invalid("auth_token must be set".into()))?;

    let storage = raw.storage.map(convert_storage).transpose()?;
    if let Some(storage) = &storage {
        storage
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    }

    Ok(Config {
        listen,
        auth_token,
        store_path: env("OVERDROP_STORE_PATH")
            .or(raw.store_path)
            .map(PathBuf::from),
        storage,
        inventory_url: env("OVERDROP_INVENTORY_URL")
            .or(raw.services.inventory_url)
            .unwrap_or_else(|| "http://inventory:8080".to_string()),
        workflows_url: env("OVERDROP_WORKFLOWS_URL")
            .or(raw.services.workflows_url)
            .unwrap_or_else(|| "http://workflows:8080".to_string()),
        reaper_interval: Duration::from_secs(
            raw.reaper.interval_seconds.unwrap_or(DEFAULT_REAPER_INTERVAL),
        ),
        reaper_jitter: Duration::from_secs(
            raw.reaper.jitter_seconds.unwrap_or(DEFAULT_REAPER_JITTER),
        ),
        max_attempts: raw.engine.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
    })
}

fn convert_storage(raw: RawStorage) -> Result<StorageSettings, ConfigError> {
    let provider = match raw.provider.as_str() {
        "s3" => StorageProvider::S3,
        "azure" => StorageProvider::Azure,
        other => {
            return Err(ConfigError::Invalid(format!(
                "unknown storage provider '{}'",
                other
            )))
        }
    };
    Ok(StorageSettings {
        provider,
        bucket: raw.bucket,
        region: raw.region.unwrap_or_default(),
        endpoint: raw.endpoint,
        external_endpoint: raw.external_endpoint,
        key: raw.key.unwrap_or_default(),
        secret: raw.secret.unwrap_or_default(),
        connection_string: raw.connection_string,
        token: raw.token,
        force_path_style: raw.force_path_style,
        use_accelerate: raw.use_accelerate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let file = write_config("auth_token: secret\n");
        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.auth_token, "secret");
        assert!(config.store_path.is_none());
        assert!(config.storage.is_none());
        assert_eq!(config.reaper_interval, Duration::from_secs(3600));
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn full_config_round_trips() {
        let file = write_config(
            r#"
listen: 127.0.0.1:9090
auth_token: secret
store_path: /var/lib/overdrop/state.redb
storage:
  provider: s3
  bucket: artifacts
  region: eu-west-1
  key: AKIA
  secret: shh
  force_path_style: true
services:
  inventory_url: http://inv.local
  workflows_url: http://wf.local
reaper:
  interval_seconds: 60
  jitter_seconds: 5
engine:
  max_attempts: 3
"#,
        );
        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.listen.port(), 9090);
        let storage = config.storage.unwrap();
        assert_eq!(storage.provider, StorageProvider::S3);
        assert!(storage.force_path_style);
        assert_eq!(config.inventory_url, "http://inv.local");
        assert_eq!(config.reaper_interval, Duration::from_secs(60));
        assert_eq!(config.reaper_jitter, Duration::from_secs(5));
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn missing_token_is_invalid() {
        let file = write_config("listen: 0.0.0.0:8080\n");
        assert!(matches!(
            load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn malformed_listen_is_invalid() {
        let file = write_config("auth_token: secret\nlisten: not-an-addr\n");
        assert!(matches!(
            load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn incomplete_storage_is_invalid() {
        let file = write_config(
            "auth_token: secret\nstorage:\n  provider: s3\n  bucket: artifacts\n",
        );
        assert!(matches!(
            load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_provider_is_invalid() {
        let file = write_config(
            "auth_token: secret\nstorage:\n  provider: gcs\n  bucket: artifacts\n",
        );
        assert!(matches!(
            load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }
}
