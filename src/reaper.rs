use crate::error::Result;
use crate::face_index::BiometricIndex;
use crate::layout::namespace_roots;
use crate::metadata_store::MetadataStore;
use crate::object_store::ObjectStore;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Aggregate counts of one reaper run
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReapSummary {
    /// Events whose row was removed
    pub events: usize,
    /// Objects deleted across both buckets
    pub files: usize,
    /// indexed_faces rows deleted
    pub face_rows: u64,
    /// photo_index_state rows deleted
    pub state_rows: u64,
    /// Faces deleted from the biometric index
    pub faces: usize,
}

impl ReapSummary {
    fn absorb(&mut self, other: &ReapSummary) {
        self.events += other.events;
        self.files += other.files;
        self.face_rows += other.face_rows;
        self.state_rows += other.state_rows;
        self.faces += other.faces;
    }
}

/// Cascading, batched, partial-failure-tolerant delete of expired events.
///
/// Ordering is by failure tolerance: biometric cleanup first, storage next,
/// metadata rows after, the event row itself last. Every step is idempotent
/// (deleting the already-absent is not an error), so a run killed halfway is
/// safe to re-run. A failure in the middle steps is swallowed rather than
/// letting it block the event-row delete: a dangling event row is worse than
/// a few orphaned derived objects.
pub struct LifecycleReaper {
    metadata: Arc<dyn MetadataStore>,
    originals: Arc<dyn ObjectStore>,
    derived: Arc<dyn ObjectStore>,
    index: Arc<dyn BiometricIndex>,
    batch_size: i64,
}

impl LifecycleReaper {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        originals: Arc<dyn ObjectStore>,
        derived: Arc<dyn ObjectStore>,
        index: Arc<dyn BiometricIndex>,
        batch_size: i64,
    ) -> Self {
        Self {
            metadata,
            originals,
            derived,
            index,
            batch_size,
        }
    }

    /// Reap up to `batch_size` expired events, oldest expiry first
    #[instrument(skip(self))]
    pub async fn reap(&self) -> Result<ReapSummary> {
        let expired = self.metadata.expired_events(Utc::now(), self.batch_size).await?;

        let mut summary = ReapSummary::default();

        if expired.is_empty() {
            return Ok(summary);
        }

        info!(count = expired.len(), "Reaping expired events");

        for event in &expired {
            let per_event = self.reap_event(&event.slug).await;
            summary.absorb(&per_event);
        }

        metrics::counter!("pipeline.reaper.events").increment(summary.events as u64);
        metrics::counter!("pipeline.reaper.files").increment(summary.files as u64);

        info!(
            events = summary.events,
            files = summary.files,
            face_rows = summary.face_rows,
            state_rows = summary.state_rows,
            faces = summary.faces,
            "Reap run complete"
        );

        Ok(summary)
    }

    /// Remove everything tied to one event. Middle steps are best-effort;
    /// the event row goes last and is attempted regardless.
    async fn reap_event(&self, slug: &str) -> ReapSummary {
        let mut summary = ReapSummary::default();

        // Step 1: collect face ids before the rows go away
        let face_ids = match self.metadata.face_ids_for_event(slug).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(slug = %slug, error = %e, "Could not collect face ids, skipping biometric delete");
                Vec::new()
            }
        };

        // Step 2: biometric cleanup; failure must not block storage/DB cleanup
        if !face_ids.is_empty() {
            match self.index.delete_faces(slug, &face_ids).await {
                Ok(deleted) => summary.faces = deleted,
                Err(e) => {
                    warn!(slug = %slug, error = %e, "Biometric face delete failed, continuing");
                }
            }
        }
        if let Err(e) = self.index.delete_collection(slug).await {
            warn!(slug = %slug, error = %e, "Collection delete failed, continuing");
        }

        // Step 3: storage cleanup across both buckets and both layouts
        for (store, label) in [(&self.originals, "originals"), (&self.derived, "derived")] {
            for root in namespace_roots(slug) {
                match store.list_tree(&root).await {
                    Ok(keys) if !keys.is_empty() => match store.delete_batch(&keys).await {
                        Ok(deleted) => summary.files += deleted,
                        Err(e) => {
                            warn!(slug = %slug, bucket = label, root = %root, error = %e, "Storage delete failed, continuing");
                        }
                    },
                    Ok(_) => {}
                    Err(e) => {
                        warn!(slug = %slug, bucket = label, root = %root, error = %e, "Storage listing failed, continuing");
                    }
                }
            }
        }

        // Step 4: metadata rows, with exact counts
        match self.metadata.delete_faces_for_event(slug).await {
            Ok(count) => summary.face_rows = count,
            Err(e) => warn!(slug = %slug, error = %e, "Face row delete failed, continuing"),
        }
        match self.metadata.delete_index_state_for_event(slug).await {
            Ok(count) => summary.state_rows = count,
            Err(e) => warn!(slug = %slug, error = %e, "Index state delete failed, continuing"),
        }

        // Step 5: the event row itself, always attempted
        match self.metadata.delete_event(slug).await {
            Ok(deleted) if deleted > 0 => {
                summary.events = 1;
                info!(slug = %slug, files = summary.files, "Event reaped");
            }
            Ok(_) => {
                warn!(slug = %slug, "Event row was already gone");
            }
            Err(e) => {
                error!(slug = %slug, error = %e, "Event row delete failed");
            }
        }

        summary
    }

    /// Recurring scheduler: drives `reap()` until cancelled
    pub async fn run_scheduler(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reaper scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reap().await {
                        error!(error = %e, "Scheduled reap run failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face_index::testing::FakeIndex;
    use crate::metadata_store::testing::InMemoryMetadata;
    use crate::object_store::testing::InMemoryStore;
    use chrono::Duration as ChronoDuration;

    const SLUG: &str = "gala-2024";

    struct Fixture {
        metadata: Arc<InMemoryMetadata>,
        originals: Arc<InMemoryStore>,
        derived: Arc<InMemoryStore>,
        index: Arc<FakeIndex>,
    }

    impl Fixture {
        fn reaper(&self, batch_size: i64) -> LifecycleReaper {
            LifecycleReaper::new(
                self.metadata.clone(),
                self.originals.clone(),
                self.derived.clone(),
                self.index.clone(),
                batch_size,
            )
        }
    }

    async fn expired_event_fixture() -> Fixture {
        let expired_at = Utc::now() - ChronoDuration::hours(1);
        let metadata = Arc::new(InMemoryMetadata::with_event(SLUG, Some(expired_at)));

        let photo = format!("eventos/{SLUG}/original/a.jpg");
        metadata
            .record_photo_indexed(SLUG, &photo, &[FakeIndex::record("f-1"), FakeIndex::record("f-2")])
            .await
            .unwrap();

        let originals = Arc::new(InMemoryStore::with_objects(&[
            (photo.as_str(), b"a".as_slice()),
            (&format!("{SLUG}/legacy.jpg"), b"l".as_slice()),
        ]));
        let derived = Arc::new(InMemoryStore::with_objects(&[(
            &format!("eventos/{SLUG}/thumb/a.webp"),
            b"t".as_slice(),
        )]));

        let index = Arc::new(FakeIndex::default());
        index
            .stored_faces
            .lock()
            .unwrap()
            .entry(SLUG.to_string())
            .or_default()
            .extend(["f-1".to_string(), "f-2".to_string()]);

        Fixture { metadata, originals, derived, index }
    }

    #[tokio::test]
    async fn test_reap_cascades_across_all_backends() {
        let fixture = expired_event_fixture().await;
        let reaper = fixture.reaper(20);

        let summary = reaper.reap().await.unwrap();

        assert_eq!(
            summary,
            ReapSummary { events: 1, files: 3, face_rows: 2, state_rows: 1, faces: 2 }
        );
        assert!(fixture.metadata.events.lock().unwrap().is_empty());
        assert!(fixture.metadata.faces.lock().unwrap().is_empty());
        assert!(fixture.originals.keys().is_empty());
        assert!(fixture.derived.keys().is_empty());
        assert!(fixture.index.stored_faces.lock().unwrap().get(SLUG).is_none());
    }

    #[tokio::test]
    async fn test_biometric_failure_does_not_block_cleanup() {
        let fixture = expired_event_fixture().await;
        *fixture.index.fail_delete_faces.lock().unwrap() = true;

        let summary = fixture.reaper(20).reap().await.unwrap();

        // Zero faces deleted, but everything else proceeded
        assert_eq!(summary.faces, 0);
        assert_eq!(summary.events, 1);
        assert_eq!(summary.face_rows, 2);
        assert!(fixture.metadata.events.lock().unwrap().is_empty());
        assert!(fixture.originals.keys().is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_does_not_block_row_deletes() {
        let fixture = expired_event_fixture().await;
        *fixture.originals.fail_deletes.lock().unwrap() = true;

        let summary = fixture.reaper(20).reap().await.unwrap();

        assert_eq!(summary.events, 1);
        assert_eq!(summary.face_rows, 2);
        assert!(fixture.metadata.events.lock().unwrap().is_empty());
        // Originals are orphaned this run; a later run may reclaim them
        assert!(!fixture.originals.keys().is_empty());
    }

    #[tokio::test]
    async fn test_rerun_after_partial_reap_reaches_terminal_state() {
        let fixture = expired_event_fixture().await;

        // Simulate a crash mid-reap: biometric and storage already cleared,
        // metadata rows still present.
        fixture.index.stored_faces.lock().unwrap().clear();
        fixture.originals.objects.lock().unwrap().clear();
        fixture.derived.objects.lock().unwrap().clear();

        let summary = fixture.reaper(20).reap().await.unwrap();

        // Deleting the already-absent is not an error
        assert_eq!(summary.events, 1);
        assert_eq!(summary.files, 0);
        assert_eq!(summary.face_rows, 2);
        assert!(fixture.metadata.events.lock().unwrap().is_empty());
        assert!(fixture.metadata.index_state.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_run_is_a_noop() {
        let fixture = expired_event_fixture().await;
        let reaper = fixture.reaper(20);

        reaper.reap().await.unwrap();
        let second = reaper.reap().await.unwrap();

        assert_eq!(second, ReapSummary::default());
    }

    #[tokio::test]
    async fn test_batch_bound_oldest_first() {
        let older = Utc::now() - ChronoDuration::hours(5);
        let newer = Utc::now() - ChronoDuration::hours(1);
        let metadata = Arc::new(InMemoryMetadata::default());
        metadata
            .events
            .lock()
            .unwrap()
            .push(InMemoryMetadata::event("newer", Some(newer)));
        metadata
            .events
            .lock()
            .unwrap()
            .push(InMemoryMetadata::event("older", Some(older)));
        metadata
            .events
            .lock()
            .unwrap()
            .push(InMemoryMetadata::event("active", None));

        let fixture = Fixture {
            metadata: metadata.clone(),
            originals: Arc::new(InMemoryStore::default()),
            derived: Arc::new(InMemoryStore::default()),
            index: Arc::new(FakeIndex::default()),
        };

        let summary = fixture.reaper(1).reap().await.unwrap();

        assert_eq!(summary.events, 1);
        let remaining: Vec<String> = metadata
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.slug.clone())
            .collect();
        assert!(remaining.contains(&"newer".to_string()));
        assert!(remaining.contains(&"active".to_string()));
        assert!(!remaining.contains(&"older".to_string()));
    }
}
