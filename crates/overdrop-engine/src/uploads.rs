//! Background reclamation of abandoned staged uploads.
//!
//! A single cooperative loop: each tick scans intents whose `updated`
//! stamp fell behind the jitter window, gives stalled commits another
//! chance, and garbage-collects dangling `.part` objects. Errors abort the
//! current pass only; the next tick starts clean.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use overdrop_domain::{IntentStatus, LinkStatus, UploadIntent};
use overdrop_objstore::{staged_object, ObjStoreError};
use overdrop_store::StoreError;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::Engine;

pub struct UploadReaper {
    engine: Arc<Engine>,
    /// Tick period. Zero means one pass and exit (batch jobs, tests).
    interval: Duration,
    /// Intents updated within this window are never swept.
    jitter: Duration,
    /// How long a Processing intent may idle before its commit is assumed
    /// dead and retried. Longer than any realistic in-flight upload.
    inprogress_idle: Duration,
}

impl UploadReaper {
    pub fn new(
        engine: Arc<Engine>,
        interval: Duration,
        jitter: Duration,
        inprogress_idle: Duration,
    ) -> Self {
        UploadReaper {
            engine,
            interval,
            jitter,
            inprogress_idle,
        }
    }

    /// Run until cancelled. Returns the cancel cause; in single-shot mode
    /// (`interval == 0`) returns the result of the one pass.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        if self.interval.is_zero() {
            return self.sweep(&shutdown).await;
        }
        let mut shutdown_signal = shutdown.clone();
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown_signal.changed() => return Err(EngineError::Cancelled),
                _ = ticker.tick() => {
                    match self.sweep(&shutdown).await {
                        Ok(()) => {}
                        Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                        Err(e) => warn!(error = %e, "upload reaper pass failed"),
                    }
                }
            }
        }
    }

    /// One pass over the expired intents. The cursor is closed on every
    /// exit path, including cancellation and mid-pass errors.
    async fn sweep(&self, shutdown: &watch::Receiver<bool>) -> Result<(), EngineError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.jitter).unwrap_or_else(|_| chrono::Duration::zero());
        let mut cursor = self
            .engine
            .store
            .scan_expired_upload_intents(cutoff)
            .await?;

        let mut result = Ok(());
        loop {
            if *shutdown.borrow() {
                result = Err(EngineError::Cancelled);
                break;
            }
            match cursor.next().await {
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
                Ok(None) => break,
                Ok(Some(intent)) => {
                    if let Err(e) = self.process(&intent).await {
                        result = Err(e);
                        break;
                    }
                }
            }
        }
        cursor.close().await;
        result
    }

    async fn process(&self, intent: &UploadIntent) -> Result<(), EngineError> {
        let now = Utc::now();
        let idle_cutoff = now
            - chrono::Duration::from_std(self.inprogress_idle)
                .unwrap_or_else(|_| chrono::Duration::zero());

        if intent.status.base() == LinkStatus::Processing {
            // A commit that has idled past the threshold is assumed dead;
            // hand the intent back so the commit path can be retried.
            if intent.updated < idle_cutoff {
                match self
                    .engine
                    .store
                    .update_upload_intent_status(
                        &intent.tenant,
                        intent.id,
                        intent.status,
                        intent.status.with_base(LinkStatus::Pending),
                        now,
                    )
                    .await
                {
                    Ok(()) => {
                        debug!(artifact = %intent.id, "reset stalled processing intent")
                    }
                    // Changed under us: someone finished the commit.
                    Err(StoreError::NotFound) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok(());
        }

        if intent.status.processed() {
            return Ok(());
        }

        // Pending, Completed or Aborted with cleanup still owed: drop the
        // staged object, then record the cleanup in the processed bit.
        let objstore = self.engine.object_store(&intent.tenant).await?;
        match objstore
            .delete_object(&staged_object(&intent.tenant, intent.id))
            .await
        {
            Ok(()) | Err(ObjStoreError::ObjectNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let new_base = match intent.status.base() {
            LinkStatus::Pending => LinkStatus::Aborted,
            other => other,
        };
        let new = IntentStatus::new(new_base).with_processed();
        match self
            .engine
            .store
            .update_upload_intent_status(&intent.tenant, intent.id, intent.status, new, now)
            .await
        {
            Ok(()) => debug!(artifact = %intent.id, status = %new, "reclaimed staged upload"),
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
