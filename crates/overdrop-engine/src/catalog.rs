//! Artifact catalog: staged uploads, image ingestion and uniqueness,
//! releases, tags and notes.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use overdrop_clients::GenerateArtifactArgs;
use overdrop_domain::{
    ArtifactInfo, Image, ImageId, IntentStatus, LinkStatus, Payload, Release, Tag, Tenant,
    UploadIntent, UploadLink,
};
use overdrop_objstore::{artifact_object, staged_object};
use overdrop_store::{ImageFilter, ReleaseFilter};
use serde_json::Value;
use tracing::warn;

use crate::error::EngineError;
use crate::Engine;

pub const MAX_NOTES_LEN: usize = 1024;

/// Metadata the upload commit carries; the artifact-generation workflow
/// fills in the rest by reading the staged object.
#[derive(Debug, Clone)]
pub struct CommitUpload {
    pub artifact_name: String,
    pub device_types: Vec<String>,
}

/// Everything needed to register a generated artifact in the catalog.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub description: String,
    pub name: String,
    pub device_types: Vec<String>,
    pub info: ArtifactInfo,
    pub signed: bool,
    pub updates: Vec<Payload>,
    pub provides: HashMap<String, String>,
    pub depends: HashMap<String, Value>,
    pub size: i64,
}

impl Engine {
    // ── Staged uploads ───────────────────────────────────────────────────

    /// Open an upload slot: a presigned PUT at `{tenant}/{id}.part` plus a
    /// pending intent the reaper reconciles if the client walks away.
    pub async fn stage_upload(
        &self,
        tenant: &Tenant,
        expire: Duration,
    ) -> Result<UploadIntent, EngineError> {
        self.check_storage_limit(tenant).await?;
        let id = ImageId::generate();
        let objstore = self.object_store(tenant).await?;
        let link = objstore
            .put_request(&staged_object(tenant, id), expire)
            .await?;
        let intent = UploadIntent::new(id, tenant.clone(), link, Utc::now());
        self.store.insert_upload_intent(&intent).await?;
        Ok(intent)
    }

    /// Commit a staged upload: flip the intent to Processing and hand the
    /// object to the artifact-generation workflow. A failed workflow start
    /// aborts the intent so the reaper reclaims the object.
    pub async fn commit_upload(
        &self,
        tenant: &Tenant,
        id: ImageId,
        commit: CommitUpload,
    ) -> Result<(), EngineError> {
        let intent = self
            .store
            .get_upload_intent(tenant, id)
            .await?
            .ok_or(EngineError::NotFound)?;
        if intent.status.base() != LinkStatus::Pending {
            return Err(EngineError::Conflict(format!(
                "upload is {}, not pending",
                intent.status
            )));
        }
        self.store
            .update_upload_intent_status(
                tenant,
                id,
                intent.status,
                intent.status.with_base(LinkStatus::Processing),
                Utc::now(),
            )
            .await?;

        let args = GenerateArtifactArgs::new(
            tenant,
            id,
            commit.artifact_name,
            commit.device_types,
            staged_object(tenant, id),
        );
        if let Err(e) = self.workflows.start_generate_artifact(&args).await {
            // Roll the intent back to aborted; the reaper cleans the object.
            if let Err(cas) = self
                .store
                .update_upload_intent_status(
                    tenant,
                    id,
                    intent.status.with_base(LinkStatus::Processing),
                    intent.status.with_base(LinkStatus::Aborted),
                    Utc::now(),
                )
                .await
            {
                warn!(artifact = %id, error = %cas, "could not abort upload intent");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Workflow callback after a successful generation: register the image
    /// and complete the intent. Not atomic with the object rename; the
    /// reaper's in-progress CAS is the reconciliation path for a crash in
    /// between.
    pub async fn complete_upload(
        &self,
        tenant: &Tenant,
        id: ImageId,
        image: NewImage,
    ) -> Result<Image, EngineError> {
        let intent = self
            .store
            .get_upload_intent(tenant, id)
            .await?
            .ok_or(EngineError::NotFound)?;
        if intent.status.base() != LinkStatus::Processing {
            return Err(EngineError::Conflict(format!(
                "upload is {}, not processing",
                intent.status
            )));
        }
        let result = self.create_image_with_id(tenant, id, image).await;
        let new_base = if result.is_ok() {
            LinkStatus::Completed
        } else {
            LinkStatus::Aborted
        };
        if let Err(cas) = self
            .store
            .update_upload_intent_status(
                tenant,
                id,
                intent.status,
                intent.status.with_base(new_base),
                Utc::now(),
            )
            .await
        {
            warn!(artifact = %id, error = %cas, "upload intent changed during completion");
        }
        result
    }

    /// The generation workflow failed: abort the intent.
    pub async fn fail_upload(&self, tenant: &Tenant, id: ImageId) -> Result<(), EngineError> {
        self.store
            .update_upload_intent_status(
                tenant,
                id,
                IntentStatus::PROCESSING,
                IntentStatus::ABORTED,
                Utc::now(),
            )
            .await?;
        Ok(())
    }

    async fn check_storage_limit(&self, tenant: &Tenant) -> Result<(), EngineError> {
        let Some(limit) = self.store.get_storage_limit(tenant).await? else {
            return Ok(());
        };
        let images = self
            .store
            .list_images(tenant, &ImageFilter::default())
            .await?;
        let usage: i64 = images.iter().map(|i| i.size).sum();
        if usage >= limit as i64 {
            return Err(EngineError::Conflict(format!(
                "storage limit of {} bytes reached",
                limit
            )));
        }
        Ok(())
    }

    // ── Images ───────────────────────────────────────────────────────────

    pub async fn create_image(
        &self,
        tenant: &Tenant,
        image: NewImage,
    ) -> Result<Image, EngineError> {
        self.create_image_with_id(tenant, ImageId::generate(), image)
            .await
    }

    async fn create_image_with_id(
        &self,
        tenant: &Tenant,
        id: ImageId,
        new: NewImage,
    ) -> Result<Image, EngineError> {
        let image = Image::new(
            id,
            new.name,
            new.description,
            new.device_types,
            new.info,
            new.signed,
            new.updates,
            new.provides,
            new.depends,
            new.size,
            Utc::now(),
        )?;
        self.store.insert_image(tenant, &image).await?;
        Ok(image)
    }

    /// Whether a new artifact with this name/device-type set could coexist
    /// with the catalog. It can iff every already-stored candidate targets
    /// devices through a non-trivial depends set.
    pub async fn is_artifact_unique(
        &self,
        tenant: &Tenant,
        name: &str,
        device_types: &[String],
    ) -> Result<bool, EngineError> {
        let existing = self.store.images_by_name(tenant, name).await?;
        Ok(existing
            .iter()
            .filter(|i| device_types.iter().any(|t| i.supports_device_type(t)))
            .all(|i| i.has_non_trivial_depends()))
    }

    pub async fn get_image(&self, tenant: &Tenant, id: ImageId) -> Result<Image, EngineError> {
        self.store
            .find_image(tenant, id)
            .await?
            .ok_or(EngineError::NotFound)
    }

    pub async fn list_images(
        &self,
        tenant: &Tenant,
        filter: &ImageFilter,
    ) -> Result<Vec<Image>, EngineError> {
        Ok(self.store.list_images(tenant, filter).await?)
    }

    /// Only the description is mutable on a stored image.
    pub async fn edit_image_description(
        &self,
        tenant: &Tenant,
        id: ImageId,
        description: String,
    ) -> Result<(), EngineError> {
        Ok(self
            .store
            .update_image_description(tenant, id, description, Utc::now())
            .await?)
    }

    /// Delete an image and its object. Refused while any unfinished
    /// deployment references it.
    pub async fn delete_image(&self, tenant: &Tenant, id: ImageId) -> Result<(), EngineError> {
        let image = self.get_image(tenant, id).await?;
        if self
            .store
            .exists_unfinished_deployment_by_artifact(tenant, id)
            .await?
        {
            return Err(EngineError::Conflict(
                "image is used by an active deployment".into(),
            ));
        }
        let objstore = self.object_store(tenant).await?;
        match objstore.delete_object(&artifact_object(tenant, id)).await {
            Ok(()) | Err(overdrop_objstore::ObjStoreError::ObjectNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.store.delete_image(tenant, id).await?;
        if self.store.images_by_name(tenant, &image.name).await?.is_empty() {
            self.store.delete_releases_by_name(tenant, &image.name).await?;
        }
        Ok(())
    }

    /// Presigned download for an image's content.
    pub async fn download_link(
        &self,
        tenant: &Tenant,
        id: ImageId,
        expire: Duration,
    ) -> Result<UploadLink, EngineError> {
        let image = self.get_image(tenant, id).await?;
        let objstore = self.object_store(tenant).await?;
        Ok(objstore
            .get_request(
                &artifact_object(tenant, id),
                expire,
                Some(&format!("{}.artifact", image.name)),
            )
            .await?)
    }

    // ── Releases ─────────────────────────────────────────────────────────

    pub async fn list_releases(
        &self,
        tenant: &Tenant,
        filter: &ReleaseFilter,
    ) -> Result<Vec<Release>, EngineError> {
        Ok(self.store.list_releases(tenant, filter).await?)
    }

    /// Delete a whole release: every image plus their objects. Refused
    /// while any of its images is referenced by an unfinished deployment.
    pub async fn delete_release(&self, tenant: &Tenant, name: &str) -> Result<(), EngineError> {
        let images = self.store.images_by_name(tenant, name).await?;
        if images.is_empty() {
            return Err(EngineError::NotFound);
        }
        for image in &images {
            if self
                .store
                .exists_unfinished_deployment_by_artifact(tenant, image.id)
                .await?
            {
                return Err(EngineError::Conflict(
                    "release is used by an active deployment".into(),
                ));
            }
        }
        let objstore = self.object_store(tenant).await?;
        for image in &images {
            match objstore
                .delete_object(&artifact_object(tenant, image.id))
                .await
            {
                Ok(()) | Err(overdrop_objstore::ObjStoreError::ObjectNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.store.delete_images_by_name(tenant, name).await?;
        self.store.delete_releases_by_name(tenant, name).await?;
        Ok(())
    }

    pub async fn replace_release_tags(
        &self,
        tenant: &Tenant,
        name: &str,
        tags: Vec<Tag>,
    ) -> Result<(), EngineError> {
        Ok(self.store.replace_release_tags(tenant, name, tags).await?)
    }

    pub async fn list_tags(&self, tenant: &Tenant) -> Result<Vec<Tag>, EngineError> {
        Ok(self.store.list_tags(tenant).await?)
    }

    pub async fn list_update_types(&self, tenant: &Tenant) -> Result<Vec<String>, EngineError> {
        Ok(self.store.list_update_types(tenant).await?)
    }

    pub async fn update_release_notes(
        &self,
        tenant: &Tenant,
        name: &str,
        notes: String,
    ) -> Result<(), EngineError> {
        if notes.len() > MAX_NOTES_LEN {
            return Err(EngineError::InvalidInput(format!(
                "notes cannot exceed {} characters",
                MAX_NOTES_LEN
            )));
        }
        Ok(self.store.update_release_notes(tenant, name, notes).await?)
    }
}
