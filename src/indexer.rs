use crate::error::{PipelineError, Result};
use crate::face_index::{BiometricIndex, S3Ref};
use crate::layout::resolve_originals;
use crate::metadata_store::MetadataStore;
use crate::object_store::ObjectStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Counts reported by an indexing run
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IndexOutcome {
    /// Photos submitted to the biometric index this run
    pub indexed: usize,
    /// Photos already covered by an earlier run
    pub skipped: usize,
    /// Photos whose indexing call failed; retried on the next run
    pub failed: usize,
}

/// Drives idempotent ingestion of an event's photos into the biometric
/// collection and the metadata store.
///
/// Best-effort per photo: a failing photo is counted and the batch moves on.
/// The `(event_slug, photo_key)` state row is the idempotency key; it is
/// written in the same transaction as the face rows, so a failed photo never
/// leaves partial rows behind.
pub struct FaceIndexer {
    originals: Arc<dyn ObjectStore>,
    originals_bucket: String,
    metadata: Arc<dyn MetadataStore>,
    index: Arc<dyn BiometricIndex>,
}

impl FaceIndexer {
    pub fn new(
        originals: Arc<dyn ObjectStore>,
        originals_bucket: String,
        metadata: Arc<dyn MetadataStore>,
        index: Arc<dyn BiometricIndex>,
    ) -> Self {
        Self {
            originals,
            originals_bucket,
            metadata,
            index,
        }
    }

    /// Index every not-yet-indexed original photo of an event
    #[instrument(skip(self))]
    pub async fn index_event(&self, slug: &str) -> Result<IndexOutcome> {
        self.metadata
            .get_event_by_slug(slug)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("event '{slug}'")))?;

        let (layout, photos) = resolve_originals(self.originals.as_ref(), slug).await?;

        let mut outcome = IndexOutcome::default();

        if photos.is_empty() {
            info!(slug = %slug, "No originals found, nothing to index");
            return Ok(outcome);
        }

        info!(slug = %slug, layout = ?layout, photos = photos.len(), "Indexing event photos");

        // The collection may not exist yet; creating it when it already does
        // is success.
        self.index.ensure_collection(slug).await?;

        for photo_key in &photos {
            // Dedup check precedes the remote call
            if self.metadata.is_photo_indexed(slug, photo_key).await? {
                outcome.skipped += 1;
                continue;
            }

            let image = S3Ref {
                bucket: self.originals_bucket.clone(),
                key: photo_key.clone(),
            };

            match self.index.index_faces(slug, &image).await {
                Ok(faces) => {
                    if faces.is_empty() {
                        warn!(slug = %slug, photo_key = %photo_key, "No faces found in photo");
                    }
                    // State row is written even for zero faces so re-runs
                    // skip the photo instead of resubmitting it.
                    match self.metadata.record_photo_indexed(slug, photo_key, &faces).await {
                        Ok(written) => {
                            outcome.indexed += 1;
                            metrics::counter!("pipeline.photos.indexed").increment(1);
                            metrics::counter!("pipeline.faces.persisted").increment(written as u64);
                        }
                        Err(e) => {
                            warn!(slug = %slug, photo_key = %photo_key, error = %e, "Failed to persist face rows");
                            outcome.failed += 1;
                            metrics::counter!("pipeline.photos.index_failed").increment(1);
                        }
                    }
                }
                Err(e) => {
                    warn!(slug = %slug, photo_key = %photo_key, error = %e, "Face indexing call failed");
                    outcome.failed += 1;
                    metrics::counter!("pipeline.photos.index_failed").increment(1);
                }
            }
        }

        info!(
            slug = %slug,
            indexed = outcome.indexed,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "Indexing run complete"
        );

        Ok(outcome)
    }
}
