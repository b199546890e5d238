use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use overdrop_domain::{StorageProvider, StorageSettings, UploadLink};
use sha2::Sha256;
use tracing::debug;

use crate::error::ObjStoreError;
use crate::s3::{uri_encode, xml_text};
use crate::store::{ObjectStore, HEALTH_CHECK_TIMEOUT};

type HmacSha256 = Hmac<Sha256>;

const SAS_VERSION: &str = "2021-12-02";

fn sas_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Azure Blob Storage adapter. Every operation, including direct delete and
/// the container probe, goes through a service SAS signed with the shared
/// account key, so no separate authorization scheme is needed.
pub struct AzureBlobStore {
    account: String,
    container: String,
    /// Decoded shared account key.
    key: Vec<u8>,
    endpoint: Option<String>,
    external_endpoint: Option<String>,
    client: reqwest::Client,
}

impl AzureBlobStore {
    pub fn from_settings(settings: &StorageSettings) -> Result<Self, ObjStoreError> {
        if settings.provider != StorageProvider::Azure {
            return Err(ObjStoreError::InvalidSettings(
                "settings do not describe an azure store".into(),
            ));
        }
        settings
            .validate()
            .map_err(|e| ObjStoreError::InvalidSettings(e.to_string()))?;

        let (account, key_b64, endpoint) = match &settings.connection_string {
            Some(cs) => parse_connection_string(cs)?,
            None => (settings.key.clone(), settings.secret.clone(), None),
        };
        let key = base64::engine::general_purpose::STANDARD
            .decode(&key_b64)
            .map_err(|e| {
                ObjStoreError::InvalidSettings(format!("account key is not base64: {}", e))
            })?;

        Ok(AzureBlobStore {
            account,
            container: settings.bucket.clone(),
            key,
            endpoint: settings.endpoint.clone().or(endpoint),
            external_endpoint: settings.external_endpoint.clone(),
            client: reqwest::Client::new(),
        })
    }

    fn base(&self, external: bool) -> String {
        let endpoint = if external {
            self.external_endpoint.as_ref().or(self.endpoint.as_ref())
        } else {
            self.endpoint.as_ref()
        };
        match endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", self.account),
        }
    }

    /// Sign a service SAS. `resource` is `"b"` for a blob, `"c"` for the
    /// container; `content_disposition` lands in `rscd` and the
    /// string-to-sign.
    fn sas_query(
        &self,
        permissions: &str,
        resource: &str,
        blob: Option<&str>,
        expire: Duration,
        content_disposition: Option<&str>,
    ) -> String {
        let start = Utc::now() - chrono::Duration::minutes(5);
        let expiry = Utc::now()
            + chrono::Duration::from_std(expire).unwrap_or_else(|_| chrono::Duration::zero());
        let st = sas_time(start);
        let se = sas_time(expiry);

        let canonical = match blob {
            Some(blob) => format!("/blob/{}/{}/{}", self.account, self.container, blob),
            None => format!("/blob/{}/{}", self.account, self.container),
        };
        let rscd = content_disposition.unwrap_or("");

        // Field order per the service-SAS spec for version 2020-12-06 and
        // later: sp, st, se, canonicalizedResource, identifier, sip, spr,
        // sv, sr, snapshot, encryptionScope, rscc, rscd, rsce, rscl, rsct.
        let string_to_sign = format!(
            "{sp}\n{st}\n{se}\n{res}\n\n\n\n{sv}\n{sr}\n\n\n\n{rscd}\n\n\n",
            sp = permissions,
            st = st,
            se = se,
            res = canonical,
            sv = SAS_VERSION,
            sr = resource,
            rscd = rscd,
        );
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(string_to_sign.as_bytes());
        let sig =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        let mut query = format!(
            "sv={}&st={}&se={}&sr={}&sp={}&sig={}",
            SAS_VERSION,
            uri_encode(&st, true),
            uri_encode(&se, true),
            resource,
            permissions,
            uri_encode(&sig, true),
        );
        if !rscd.is_empty() {
            query.push_str(&format!("&rscd={}", uri_encode(rscd, true)));
        }
        query
    }

    fn blob_link(
        &self,
        method: &str,
        key: &str,
        permissions: &str,
        expire: Duration,
        content_disposition: Option<&str>,
        external: bool,
    ) -> UploadLink {
        let query = self.sas_query(permissions, "b", Some(key), expire, content_disposition);
        UploadLink {
            uri: format!(
                "{}/{}/{}?{}",
                self.base(external),
                self.container,
                uri_encode(key, false),
                query
            ),
            method: method.to_string(),
            expire: Utc::now()
                + chrono::Duration::from_std(expire).unwrap_or_else(|_| chrono::Duration::zero()),
            headers: [(
                "x-ms-blob-type".to_string(),
                "BlockBlob".to_string(),
            )]
            .into_iter()
            .filter(|_| method == "PUT")
            .collect(),
        }
    }
}

fn parse_connection_string(
    cs: &str,
) -> Result<(String, String, Option<String>), ObjStoreError> {
    let mut account = None;
    let mut key = None;
    let mut blob_endpoint = None;
    for part in cs.split(';').filter(|p| !p.is_empty()) {
        let (k, v) = part.split_once('=').ok_or_else(|| {
            ObjStoreError::InvalidSettings("malformed connection string".into())
        })?;
        match k {
            "AccountName" => account = Some(v.to_string()),
            // AccountKey is base64 and itself contains '=' padding, which
            // split_once leaves intact.
            "AccountKey" => key = Some(v.to_string()),
            "BlobEndpoint" => blob_endpoint = Some(v.to_string()),
            _ => {}
        }
    }
    match (account, key) {
        (Some(account), Some(key)) => Ok((account, key, blob_endpoint)),
        _ => Err(ObjStoreError::InvalidSettings(
            "connection string needs AccountName and AccountKey".into(),
        )),
    }
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn get_request(
        &self,
        key: &str,
        expire: Duration,
        filename: Option<&str>,
    ) -> Result<UploadLink, ObjStoreError> {
        let disposition = filename.map(|f| format!("attachment; filename=\"{}\"", f));
        Ok(self.blob_link("GET", key, "r", expire, disposition.as_deref(), true))
    }

    async fn put_request(
        &self,
        key: &str,
        expire: Duration,
    ) -> Result<UploadLink, ObjStoreError> {
        Ok(self.blob_link("PUT", key, "cw", expire, None, true))
    }

    async fn delete_request(
        &self,
        key: &str,
        expire: Duration,
    ) -> Result<UploadLink, ObjStoreError> {
        Ok(self.blob_link("DELETE", key, "d", expire, None, true))
    }

    async fn delete_object(&self, key: &str) -> Result<(), ObjStoreError> {
        let link = self.blob_link("DELETE", key, "d", Duration::from_secs(300), None, false);
        let response = self
            .client
            .delete(&link.uri)
            .send()
            .await
            .map_err(|e| ObjStoreError::Unavailable(format!("azure delete: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            debug!(key, "deleted blob");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let code = xml_text(&body, "Code").unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND || code == "BlobNotFound" {
            return Err(ObjStoreError::ObjectNotFound(key.to_string()));
        }
        Err(ObjStoreError::Unavailable(format!(
            "azure delete returned {}: {}",
            status,
            xml_text(&body, "Message").unwrap_or(code)
        )))
    }

    async fn health_check(&self) -> Result<(), ObjStoreError> {
        let query = self.sas_query("l", "c", None, Duration::from_secs(300), None);
        let url = format!(
            "{}/{}?restype=container&comp=list&maxresults=1&{}",
            self.base(false),
            self.container,
            query
        );
        let response = self
            .client
            .get(&url)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
            .map_err(|e| ObjStoreError::Unavailable(format!("azure health: {}", e)))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ObjStoreError::Unavailable(format!(
                "azure health returned {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param_contains};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY: &str = "c2VjcmV0LWFjY291bnQta2V5LWZvci10ZXN0cw==";

    fn settings(endpoint: Option<String>) -> StorageSettings {
        StorageSettings {
            provider: StorageProvider::Azure,
            bucket: "artifacts".into(),
            key: "testaccount".into(),
            secret: TEST_KEY.into(),
            endpoint,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn connection_string_parsing() {
        let (account, key, endpoint) = parse_connection_string(
            "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey=a2V5PT0=;EndpointSuffix=core.windows.net",
        )
        .unwrap();
        assert_eq!(account, "acct");
        assert_eq!(key, "a2V5PT0=");
        assert!(endpoint.is_none());

        let (_, _, endpoint) = parse_connection_string(
            "AccountName=dev;AccountKey=a2V5;BlobEndpoint=http://127.0.0.1:10000/dev",
        )
        .unwrap();
        assert_eq!(endpoint.as_deref(), Some("http://127.0.0.1:10000/dev"));

        assert!(parse_connection_string("AccountName=only").is_err());
    }

    #[tokio::test]
    async fn put_link_is_a_sas_url_with_blob_type_header() {
        let store = AzureBlobStore::from_settings(&settings(None)).unwrap();
        let link = store
            .put_request("acme/abc.part", Duration::from_secs(900))
            .await
            .unwrap();

        assert!(link
            .uri
            .starts_with("https://testaccount.blob.core.windows.net/artifacts/acme/abc.part?"));
        assert!(link.uri.contains(&format!("sv={}", SAS_VERSION)));
        assert!(link.uri.contains("sp=cw"));
        assert!(link.uri.contains("sr=b"));
        assert!(link.uri.contains("sig="));
        assert_eq!(
            link.headers.get("x-ms-blob-type").map(String::as_str),
            Some("BlockBlob")
        );
    }

    #[tokio::test]
    async fn get_link_carries_content_disposition() {
        let store = AzureBlobStore::from_settings(&settings(None)).unwrap();
        let link = store
            .get_request("abc", Duration::from_secs(60), Some("artifact.swu"))
            .await
            .unwrap();
        assert!(link.uri.contains("sp=r"));
        assert!(link.uri.contains("rscd="));
        assert!(link.headers.is_empty());
    }

    #[tokio::test]
    async fn delete_blob_success_and_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/artifacts/abc"))
            .and(query_param_contains("sp", "d"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/artifacts/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_string(
                "<Error><Code>BlobNotFound</Code><Message>no blob</Message></Error>",
            ))
            .mount(&server)
            .await;

        let store = AzureBlobStore::from_settings(&settings(Some(server.uri()))).unwrap();
        store.delete_object("abc").await.unwrap();
        assert!(matches!(
            store.delete_object("gone").await,
            Err(ObjStoreError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn health_check_lists_the_container() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifacts"))
            .and(query_param_contains("restype", "container"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = AzureBlobStore::from_settings(&settings(Some(server.uri()))).unwrap();
        store.health_check().await.unwrap();
    }
}
