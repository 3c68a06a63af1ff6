use crate::config::RekognitionConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_rekognition::error::DisplayErrorContext;
use aws_sdk_rekognition::primitives::Blob;
use aws_sdk_rekognition::types::{Image, S3Object};
use aws_sdk_rekognition::Client as RekognitionClient;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Face bounding box in relative coordinates, as issued by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub width: f32,
    pub height: f32,
    pub left: f32,
    pub top: f32,
}

/// One face accepted for persistence: both an identifier and a box are present
#[derive(Debug, Clone, PartialEq)]
pub struct FaceRecord {
    pub face_id: String,
    pub bbox: BoundingBox,
}

/// Reference to an object already sitting in the object store
#[derive(Debug, Clone)]
pub struct S3Ref {
    pub bucket: String,
    pub key: String,
}

/// Per-event biometric face index
#[async_trait]
pub trait BiometricIndex: Send + Sync {
    /// Create the collection if it does not exist; "already exists" is success
    async fn ensure_collection(&self, id: &str) -> Result<()>;

    /// Delete the collection; "not found" is success
    async fn delete_collection(&self, id: &str) -> Result<()>;

    /// Index every face in the referenced image. Faces missing an identifier
    /// or a bounding box are dropped before returning.
    async fn index_faces(&self, collection: &str, image: &S3Ref) -> Result<Vec<FaceRecord>>;

    /// Delete face ids in service-sized batches; returns faces deleted
    async fn delete_faces(&self, collection: &str, face_ids: &[String]) -> Result<usize>;

    /// Number of faces detectable in the given image bytes
    async fn detect_face_count(&self, image: Bytes) -> Result<usize>;

    /// Similarities (percent) of faces in the target matching the source,
    /// already filtered by the service to the given threshold
    async fn compare_faces(&self, source: Bytes, target: &S3Ref, threshold: f32)
        -> Result<Vec<f32>>;
}

/// Rekognition-backed biometric index
pub struct RekognitionIndex {
    client: RekognitionClient,
    timeout: Duration,
    delete_batch_size: usize,
}

impl RekognitionIndex {
    pub async fn new(config: &RekognitionConfig) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let client = RekognitionClient::new(&aws_config);

        info!(region = %config.region, "Rekognition index initialized");

        Ok(Self {
            client,
            timeout: Duration::from_secs(config.request_timeout_secs),
            delete_batch_size: config.face_delete_batch_size.max(1).min(1000),
        })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| PipelineError::transient("rekognition", "request timed out"))?
    }
}

fn s3_image(target: &S3Ref) -> Image {
    Image::builder()
        .s3_object(
            S3Object::builder()
                .bucket(&target.bucket)
                .name(&target.key)
                .build(),
        )
        .build()
}

fn bytes_image(bytes: Bytes) -> Image {
    Image::builder().bytes(Blob::new(bytes.to_vec())).build()
}

/// Drive chunked face deletion. A failed batch is logged and counted as
/// zero; the remaining batches still run. The collection delete that
/// follows in the reap path removes any survivors.
async fn drain_face_chunks<F, Fut>(face_ids: &[String], batch_size: usize, mut delete_chunk: F) -> usize
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<usize>>,
{
    let mut deleted = 0usize;

    for chunk in face_ids.chunks(batch_size) {
        match delete_chunk(chunk.to_vec()).await {
            Ok(count) => deleted += count,
            Err(e) => {
                warn!(batch = chunk.len(), error = %e, "Face delete batch failed, continuing");
            }
        }
    }

    deleted
}

#[async_trait]
impl BiometricIndex for RekognitionIndex {
    #[instrument(skip(self))]
    async fn ensure_collection(&self, id: &str) -> Result<()> {
        let result = self
            .bounded(async {
                match self.client.create_collection().collection_id(id).send().await {
                    Ok(_) => Ok(true),
                    Err(e) => {
                        if e.as_service_error()
                            .map(|s| s.is_resource_already_exists_exception())
                            .unwrap_or(false)
                        {
                            Ok(false)
                        } else {
                            Err(PipelineError::remote("rekognition", DisplayErrorContext(&e)))
                        }
                    }
                }
            })
            .await?;

        if result {
            info!(collection = %id, "Biometric collection created");
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_collection(&self, id: &str) -> Result<()> {
        self.bounded(async {
            match self.client.delete_collection().collection_id(id).send().await {
                Ok(_) => Ok(()),
                Err(e) => {
                    if e.as_service_error()
                        .map(|s| s.is_resource_not_found_exception())
                        .unwrap_or(false)
                    {
                        Ok(())
                    } else {
                        Err(PipelineError::remote("rekognition", DisplayErrorContext(&e)))
                    }
                }
            }
        })
        .await
    }

    #[instrument(skip(self), fields(key = %image.key))]
    async fn index_faces(&self, collection: &str, image: &S3Ref) -> Result<Vec<FaceRecord>> {
        let response = self
            .bounded(async {
                self.client
                    .index_faces()
                    .collection_id(collection)
                    .image(s3_image(image))
                    .send()
                    .await
                    .map_err(|e| PipelineError::remote("rekognition", DisplayErrorContext(&e)))
            })
            .await?;

        let records: Vec<FaceRecord> = response
            .face_records()
            .iter()
            .filter_map(|record| {
                let face = record.face()?;
                let face_id = face.face_id()?.to_string();
                let bbox = face.bounding_box()?;
                Some(FaceRecord {
                    face_id,
                    bbox: BoundingBox {
                        width: bbox.width().unwrap_or_default(),
                        height: bbox.height().unwrap_or_default(),
                        left: bbox.left().unwrap_or_default(),
                        top: bbox.top().unwrap_or_default(),
                    },
                })
            })
            .collect();

        debug!(
            collection = %collection,
            key = %image.key,
            faces = records.len(),
            "Faces indexed"
        );

        Ok(records)
    }

    #[instrument(skip(self, face_ids), fields(count = face_ids.len()))]
    async fn delete_faces(&self, collection: &str, face_ids: &[String]) -> Result<usize> {
        let deleted = drain_face_chunks(face_ids, self.delete_batch_size, |chunk| async move {
            let response = self
                .bounded(async {
                    self.client
                        .delete_faces()
                        .collection_id(collection)
                        .set_face_ids(Some(chunk))
                        .send()
                        .await
                        .map_err(|e| PipelineError::remote("rekognition", DisplayErrorContext(&e)))
                })
                .await?;

            Ok(response.deleted_faces().len())
        })
        .await;

        Ok(deleted)
    }

    #[instrument(skip(self, image), fields(size_bytes = image.len()))]
    async fn detect_face_count(&self, image: Bytes) -> Result<usize> {
        let response = self
            .bounded(async {
                self.client
                    .detect_faces()
                    .image(bytes_image(image.clone()))
                    .send()
                    .await
                    .map_err(|e| PipelineError::remote("rekognition", DisplayErrorContext(&e)))
            })
            .await?;

        Ok(response.face_details().len())
    }

    #[instrument(skip(self, source), fields(target_key = %target.key))]
    async fn compare_faces(
        &self,
        source: Bytes,
        target: &S3Ref,
        threshold: f32,
    ) -> Result<Vec<f32>> {
        let result = self
            .bounded(async {
                match self
                    .client
                    .compare_faces()
                    .source_image(bytes_image(source.clone()))
                    .target_image(s3_image(target))
                    .similarity_threshold(threshold)
                    .send()
                    .await
                {
                    Ok(response) => Ok(response
                        .face_matches()
                        .iter()
                        .filter_map(|m| m.similarity())
                        .collect()),
                    Err(e) => {
                        // No detectable face in either image is "nothing to
                        // do", not a failure.
                        if e.as_service_error()
                            .map(|s| s.is_invalid_parameter_exception())
                            .unwrap_or(false)
                        {
                            Ok(Vec::new())
                        } else {
                            Err(PipelineError::remote("rekognition", DisplayErrorContext(&e)))
                        }
                    }
                }
            })
            .await?;

        Ok(result)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Scripted biometric index for component tests
    #[derive(Default)]
    pub struct FakeIndex {
        pub collections: Mutex<HashSet<String>>,
        /// faces currently held per collection
        pub stored_faces: Mutex<HashMap<String, HashSet<String>>>,
        /// image key -> faces IndexFaces returns for it
        pub faces_per_image: Mutex<HashMap<String, Vec<FaceRecord>>>,
        /// image keys whose IndexFaces call fails
        pub failing_images: Mutex<HashSet<String>>,
        /// target key -> similarities CompareFaces returns
        pub compare_scores: Mutex<HashMap<String, Vec<f32>>>,
        /// target keys whose CompareFaces call fails
        pub failing_compares: Mutex<HashSet<String>>,
        pub detect_count: Mutex<usize>,
        pub fail_delete_faces: Mutex<bool>,
        pub index_calls: Mutex<usize>,
    }

    impl FakeIndex {
        pub fn record(face_id: &str) -> FaceRecord {
            FaceRecord {
                face_id: face_id.to_string(),
                bbox: BoundingBox { width: 0.2, height: 0.3, left: 0.1, top: 0.1 },
            }
        }
    }

    #[async_trait]
    impl BiometricIndex for FakeIndex {
        async fn ensure_collection(&self, id: &str) -> Result<()> {
            self.collections.lock().unwrap().insert(id.to_string());
            Ok(())
        }

        async fn delete_collection(&self, id: &str) -> Result<()> {
            self.collections.lock().unwrap().remove(id);
            self.stored_faces.lock().unwrap().remove(id);
            Ok(())
        }

        async fn index_faces(&self, collection: &str, image: &S3Ref) -> Result<Vec<FaceRecord>> {
            *self.index_calls.lock().unwrap() += 1;

            if self.failing_images.lock().unwrap().contains(&image.key) {
                return Err(PipelineError::remote("rekognition", "scripted failure"));
            }

            let faces = self
                .faces_per_image
                .lock()
                .unwrap()
                .get(&image.key)
                .cloned()
                .unwrap_or_default();

            let mut stored = self.stored_faces.lock().unwrap();
            let entry = stored.entry(collection.to_string()).or_default();
            for face in &faces {
                entry.insert(face.face_id.clone());
            }

            Ok(faces)
        }

        async fn delete_faces(&self, collection: &str, face_ids: &[String]) -> Result<usize> {
            if *self.fail_delete_faces.lock().unwrap() {
                return Err(PipelineError::remote("rekognition", "scripted delete failure"));
            }
            let mut stored = self.stored_faces.lock().unwrap();
            let entry = stored.entry(collection.to_string()).or_default();
            Ok(face_ids.iter().filter(|id| entry.remove(*id)).count())
        }

        async fn detect_face_count(&self, _image: Bytes) -> Result<usize> {
            Ok(*self.detect_count.lock().unwrap())
        }

        async fn compare_faces(
            &self,
            _source: Bytes,
            target: &S3Ref,
            threshold: f32,
        ) -> Result<Vec<f32>> {
            if self.failing_compares.lock().unwrap().contains(&target.key) {
                return Err(PipelineError::remote("rekognition", "scripted compare failure"));
            }
            Ok(self
                .compare_scores
                .lock()
                .unwrap()
                .get(&target.key)
                .map(|scores| scores.iter().copied().filter(|s| *s >= threshold).collect())
                .unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_failed_delete_batch_does_not_stop_later_batches() {
        let ids: Vec<String> = (0..5).map(|i| format!("face-{i}")).collect();
        let batches = Mutex::new(Vec::new());

        let deleted = drain_face_chunks(&ids, 2, |chunk| {
            batches.lock().unwrap().push(chunk.clone());
            async move {
                if chunk.contains(&"face-2".to_string()) {
                    Err(PipelineError::remote("rekognition", "scripted batch failure"))
                } else {
                    Ok(chunk.len())
                }
            }
        })
        .await;

        // Middle batch failed and counts as zero; first and last still ran
        assert_eq!(batches.lock().unwrap().len(), 3);
        assert_eq!(deleted, 3);
    }

    #[tokio::test]
    async fn test_delete_batches_respect_chunk_size() {
        let ids: Vec<String> = (0..5).map(|i| format!("face-{i}")).collect();
        let sizes = Mutex::new(Vec::new());

        drain_face_chunks(&ids, 2, |chunk| {
            sizes.lock().unwrap().push(chunk.len());
            async move { Ok(chunk.len()) }
        })
        .await;

        assert_eq!(*sizes.lock().unwrap(), vec![2, 2, 1]);
    }
}
