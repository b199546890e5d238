pub mod azure;
pub mod error;
pub mod resolver;
pub mod s3;
pub mod store;

pub use azure::AzureBlobStore;
pub use error::ObjStoreError;
pub use resolver::StoreResolver;
pub use s3::S3Store;
pub use store::{ObjectStore, HEALTH_CHECK_TIMEOUT};

use overdrop_domain::{ImageId, Tenant};

/// Object key of a committed artifact: `{tenant}/{artifact-id}`, tenant
/// segment omitted in single-tenant mode.
pub fn artifact_object(tenant: &Tenant, id: ImageId) -> String {
    if tenant.is_single() {
        id.to_string()
    } else {
        format!("{}/{}", tenant, id)
    }
}

/// Object key of a staged upload: the committed key plus `.part`.
pub fn staged_object(tenant: &Tenant, id: ImageId) -> String {
    format!("{}.part", artifact_object(tenant, id))
}

#[cfg(test)]
mod path_tests {
    use super::*;

    #[test]
    fn tenant_segment_is_omitted_in_single_tenant_mode() {
        let id = ImageId::generate();
        assert_eq!(artifact_object(&Tenant::single(), id), id.to_string());
        assert_eq!(
            artifact_object(&Tenant::new("acme"), id),
            format!("acme/{}", id)
        );
        assert_eq!(
            staged_object(&Tenant::new("acme"), id),
            format!("acme/{}.part", id)
        );
    }
}
