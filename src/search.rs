use crate::error::{PipelineError, Result};
use crate::face_index::{BiometricIndex, S3Ref};
use crate::metadata_store::MetadataStore;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// One photo estimated to contain the selfie's person
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchMatch {
    /// Object key of the matching original photo
    pub photo_key: String,
    /// Best similarity for that photo, in percent
    pub similarity: f32,
}

/// Selfie-based identity search over an event's indexed faces.
///
/// Comparisons run one photo at a time against the remote service, bounded
/// by a worker limit; ordering of the comparisons is irrelevant, only the
/// completeness of the threshold filter.
pub struct IdentitySearch {
    metadata: Arc<dyn MetadataStore>,
    index: Arc<dyn BiometricIndex>,
    originals_bucket: String,
    threshold: f32,
    concurrency: usize,
}

impl IdentitySearch {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        index: Arc<dyn BiometricIndex>,
        originals_bucket: String,
        threshold: f32,
        concurrency: usize,
    ) -> Self {
        Self {
            metadata,
            index,
            originals_bucket,
            threshold,
            concurrency: concurrency.max(1),
        }
    }

    /// Return photos of the event containing the selfie's person, best
    /// similarity first
    #[instrument(skip(self, selfie), fields(selfie_bytes = selfie.len()))]
    pub async fn search(&self, slug: &str, selfie: Bytes) -> Result<Vec<SearchMatch>> {
        if selfie.is_empty() {
            return Err(PipelineError::InvalidInput("empty selfie image".to_string()));
        }

        self.metadata
            .get_event_by_slug(slug)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("event '{slug}'")))?;

        // A selfie with no detectable face is an empty result, not an error
        if self.index.detect_face_count(selfie.clone()).await? == 0 {
            debug!(slug = %slug, "No face detected in selfie");
            return Ok(Vec::new());
        }

        let rows = self.metadata.faces_for_event(slug).await?;
        if rows.is_empty() {
            debug!(slug = %slug, "Event has no indexed faces");
            return Ok(Vec::new());
        }

        // One comparison per distinct photo; every indexed face of a photo
        // sits in the same image, so comparing the image once is complete.
        let photo_keys: Vec<String> = rows
            .iter()
            .map(|r| r.photo_key.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let total = photo_keys.len();
        let threshold = self.threshold;

        let comparisons = stream::iter(photo_keys.into_iter().map(|photo_key| {
            let selfie = selfie.clone();
            let target = S3Ref {
                bucket: self.originals_bucket.clone(),
                key: photo_key.clone(),
            };
            async move {
                let result = self.index.compare_faces(selfie, &target, threshold).await;
                (photo_key, result)
            }
        }))
        .buffer_unordered(self.concurrency)
        .collect::<Vec<_>>()
        .await;

        let mut matches = Vec::new();

        for (photo_key, result) in comparisons {
            match result {
                Ok(similarities) => {
                    let best = similarities
                        .into_iter()
                        .filter(|s| *s >= threshold)
                        .fold(None::<f32>, |acc, s| Some(acc.map_or(s, |a| a.max(s))));
                    if let Some(similarity) = best {
                        matches.push(SearchMatch { photo_key, similarity });
                    }
                }
                Err(e) => {
                    // Countable failure: the photo is skipped, the search
                    // continues.
                    warn!(photo_key = %photo_key, error = %e, "Face comparison failed");
                    metrics::counter!("pipeline.search.compare_failed").increment(1);
                }
            }
        }

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        info!(
            slug = %slug,
            photos_compared = total,
            matches = matches.len(),
            "Identity search complete"
        );

        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face_index::testing::FakeIndex;
    use crate::metadata_store::testing::InMemoryMetadata;

    const SLUG: &str = "gala-2024";

    fn key(file: &str) -> String {
        format!("eventos/{SLUG}/original/{file}")
    }

    fn search_with(metadata: Arc<InMemoryMetadata>, index: Arc<FakeIndex>) -> IdentitySearch {
        IdentitySearch::new(metadata, index, "originals".to_string(), 90.0, 4)
    }

    async fn seed_faces(metadata: &InMemoryMetadata, entries: &[(&str, &str)]) {
        for (photo, face_id) in entries {
            metadata
                .record_photo_indexed(SLUG, photo, &[FakeIndex::record(face_id)])
                .await
                .unwrap();
        }
    }

    fn selfie() -> Bytes {
        Bytes::from_static(b"selfie-bytes")
    }

    #[tokio::test]
    async fn test_no_face_in_selfie_returns_empty() {
        let metadata = Arc::new(InMemoryMetadata::with_event(SLUG, None));
        seed_faces(&metadata, &[(&key("a.jpg"), "f-a")]).await;
        let index = Arc::new(FakeIndex::default());
        *index.detect_count.lock().unwrap() = 0;

        let result = search_with(metadata, index).search(SLUG, selfie()).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_no_indexed_faces_returns_empty() {
        let metadata = Arc::new(InMemoryMetadata::with_event(SLUG, None));
        let index = Arc::new(FakeIndex::default());
        *index.detect_count.lock().unwrap() = 1;

        let result = search_with(metadata, index).search(SLUG, selfie()).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_threshold_filters_matches() {
        let metadata = Arc::new(InMemoryMetadata::with_event(SLUG, None));
        seed_faces(&metadata, &[(&key("a.jpg"), "f-a"), (&key("b.jpg"), "f-b")]).await;

        let index = Arc::new(FakeIndex::default());
        *index.detect_count.lock().unwrap() = 1;
        index
            .compare_scores
            .lock()
            .unwrap()
            .insert(key("a.jpg"), vec![95.2, 40.0]);
        index
            .compare_scores
            .lock()
            .unwrap()
            .insert(key("b.jpg"), vec![89.9]);

        let result = search_with(metadata, index).search(SLUG, selfie()).await.unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].photo_key, key("a.jpg"));
        assert!(result.iter().all(|m| m.similarity >= 90.0));
    }

    #[tokio::test]
    async fn test_matches_sorted_best_first() {
        let metadata = Arc::new(InMemoryMetadata::with_event(SLUG, None));
        seed_faces(&metadata, &[(&key("a.jpg"), "f-a"), (&key("b.jpg"), "f-b")]).await;

        let index = Arc::new(FakeIndex::default());
        *index.detect_count.lock().unwrap() = 1;
        index.compare_scores.lock().unwrap().insert(key("a.jpg"), vec![92.0]);
        index.compare_scores.lock().unwrap().insert(key("b.jpg"), vec![97.5]);

        let result = search_with(metadata, index).search(SLUG, selfie()).await.unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].photo_key, key("b.jpg"));
        assert_eq!(result[1].photo_key, key("a.jpg"));
    }

    #[tokio::test]
    async fn test_multi_face_photo_yields_one_match() {
        let metadata = Arc::new(InMemoryMetadata::with_event(SLUG, None));
        // Two indexed faces in the same photo
        metadata
            .record_photo_indexed(
                SLUG,
                &key("group.jpg"),
                &[FakeIndex::record("f-1"), FakeIndex::record("f-2")],
            )
            .await
            .unwrap();

        let index = Arc::new(FakeIndex::default());
        *index.detect_count.lock().unwrap() = 1;
        index
            .compare_scores
            .lock()
            .unwrap()
            .insert(key("group.jpg"), vec![91.0, 96.0]);

        let result = search_with(metadata, index).search(SLUG, selfie()).await.unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].similarity, 96.0);
    }

    #[tokio::test]
    async fn test_comparison_failure_skips_photo_only() {
        let metadata = Arc::new(InMemoryMetadata::with_event(SLUG, None));
        seed_faces(&metadata, &[(&key("a.jpg"), "f-a"), (&key("bad.jpg"), "f-bad")]).await;

        let index = Arc::new(FakeIndex::default());
        *index.detect_count.lock().unwrap() = 1;
        index.compare_scores.lock().unwrap().insert(key("a.jpg"), vec![93.0]);
        index.failing_compares.lock().unwrap().insert(key("bad.jpg"));

        let result = search_with(metadata, index).search(SLUG, selfie()).await.unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].photo_key, key("a.jpg"));
    }

    #[tokio::test]
    async fn test_empty_selfie_is_input_error() {
        let metadata = Arc::new(InMemoryMetadata::with_event(SLUG, None));
        let index = Arc::new(FakeIndex::default());

        let err = search_with(metadata, index)
            .search(SLUG, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }
}
