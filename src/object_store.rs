use crate::config::S3Config;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// One logical bucket of the object store.
///
/// Components hold one handle for originals and one for derived previews;
/// the two may point at the same physical bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List every key under a prefix (paginated internally, no delimiter)
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Recursively enumerate keys under a prefix, descending into
    /// sub-namespaces the way a delimiter listing exposes them
    async fn list_tree(&self, prefix: &str) -> Result<Vec<String>>;

    async fn download(&self, key: &str) -> Result<Bytes>;

    /// Upload with overwrite allowed
    async fn upload(&self, key: &str, body: Bytes, content_type: &str) -> Result<()>;

    /// Delete keys in bounded batches; absent keys are not an error
    async fn delete_batch(&self, keys: &[String]) -> Result<usize>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Time-limited URL a photographer can PUT an original to
    async fn presign_upload(&self, key: &str, content_type: &str) -> Result<String>;
}

/// S3-backed object store for one bucket
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    timeout: Duration,
    delete_batch_size: usize,
    presign_expiry: Duration,
}

impl S3ObjectStore {
    /// Create a store bound to one bucket
    pub async fn new(config: &S3Config, bucket: String) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(bucket = %bucket, region = %config.region, "S3 object store initialized");

        Ok(Self {
            client,
            bucket,
            timeout: Duration::from_secs(config.request_timeout_secs),
            delete_batch_size: config.delete_batch_size.max(1).min(1000),
            presign_expiry: Duration::from_secs(config.presigned_url_expiry_secs),
        })
    }

    /// Bound a remote call with the configured timeout
    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| PipelineError::transient("s3", "request timed out"))?
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .bounded(async {
                    self.client
                        .list_objects_v2()
                        .bucket(&self.bucket)
                        .prefix(prefix)
                        .set_continuation_token(continuation.clone())
                        .send()
                        .await
                        .map_err(|e| PipelineError::remote("s3", DisplayErrorContext(&e)))
                })
                .await?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(prefix = %prefix, count = keys.len(), "Listed objects");
        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn list_tree(&self, prefix: &str) -> Result<Vec<String>> {
        // Delimiter listing surfaces sub-namespaces as common prefixes;
        // descend into each until only keyed entries remain.
        let mut keys = Vec::new();
        let mut pending = vec![prefix.to_string()];

        while let Some(current) = pending.pop() {
            let mut continuation: Option<String> = None;

            loop {
                let response = self
                    .bounded(async {
                        self.client
                            .list_objects_v2()
                            .bucket(&self.bucket)
                            .prefix(&current)
                            .delimiter("/")
                            .set_continuation_token(continuation.clone())
                            .send()
                            .await
                            .map_err(|e| PipelineError::remote("s3", DisplayErrorContext(&e)))
                    })
                    .await?;

                keys.extend(
                    response
                        .contents()
                        .iter()
                        .filter_map(|obj| obj.key().map(String::from)),
                );

                pending.extend(
                    response
                        .common_prefixes()
                        .iter()
                        .filter_map(|p| p.prefix().map(String::from)),
                );

                match response.next_continuation_token() {
                    Some(token) if response.is_truncated().unwrap_or(false) => {
                        continuation = Some(token.to_string());
                    }
                    _ => break,
                }
            }
        }

        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn download(&self, key: &str) -> Result<Bytes> {
        let response = self
            .bounded(async {
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| {
                        if e.as_service_error().map(|s| s.is_no_such_key()).unwrap_or(false) {
                            PipelineError::NotFound(key.to_string())
                        } else {
                            PipelineError::remote("s3", DisplayErrorContext(&e))
                        }
                    })
            })
            .await?;

        let body = tokio::time::timeout(self.timeout, response.body.collect())
            .await
            .map_err(|_| PipelineError::transient("s3", "download timed out"))?
            .map_err(|e| PipelineError::remote("s3", e))?;

        Ok(body.into_bytes())
    }

    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn upload(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        self.bounded(async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(body.clone()))
                .content_type(content_type)
                .send()
                .await
                .map_err(|e| PipelineError::remote("s3", DisplayErrorContext(&e)))
        })
        .await?;

        debug!(key = %key, "Object uploaded");
        Ok(())
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn delete_batch(&self, keys: &[String]) -> Result<usize> {
        let mut deleted = 0usize;

        for chunk in keys.chunks(self.delete_batch_size) {
            let identifiers: Vec<ObjectIdentifier> = chunk
                .iter()
                .filter_map(|key| ObjectIdentifier::builder().key(key).build().ok())
                .collect();

            if identifiers.is_empty() {
                continue;
            }

            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .build()
                .map_err(|e| PipelineError::remote("s3", e))?;

            let response = self
                .bounded(async {
                    self.client
                        .delete_objects()
                        .bucket(&self.bucket)
                        .delete(delete.clone())
                        .send()
                        .await
                        .map_err(|e| PipelineError::remote("s3", DisplayErrorContext(&e)))
                })
                .await?;

            deleted += response.deleted().len();
        }

        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let result = self
            .bounded(async {
                match self
                    .client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(e) => {
                        if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) {
                            Ok(false)
                        } else {
                            Err(PipelineError::remote("s3", DisplayErrorContext(&e)))
                        }
                    }
                }
            })
            .await?;

        Ok(result)
    }

    #[instrument(skip(self))]
    async fn presign_upload(&self, key: &str, content_type: &str) -> Result<String> {
        let presigning_config = PresigningConfig::expires_in(self.presign_expiry)
            .map_err(|e| PipelineError::remote("s3", e))?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(presigning_config)
            .await
            .map_err(|e| PipelineError::remote("s3", DisplayErrorContext(&e)))?;

        Ok(presigned.uri().to_string())
    }
}

/// Content type for an object key based on its extension
pub fn content_type_for(key: &str) -> &'static str {
    match key.rsplit('.').next().map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => "application/octet-stream",
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a/b/IMG.JPG"), "image/jpeg");
        assert_eq!(content_type_for("thumb.webp"), "image/webp");
        assert_eq!(content_type_for("scan.tiff"), "image/tiff");
        assert_eq!(content_type_for("unknown"), "application/octet-stream");
    }
}
