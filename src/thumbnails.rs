use crate::config::ThumbnailConfig;
use crate::error::{PipelineError, Result};
use crate::layout::{self, resolve_originals, Layout};
use crate::object_store::ObjectStore;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Incremental status record emitted while a repair run executes
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepairEvent {
    Started { slug: String, missing: usize },
    Attempt { file: String, attempt: u32 },
    FileOk { file: String },
    FileFailed { file: String, error: String },
    Progress { done: usize, total: usize, ok: usize, failed: usize },
    Done { ok: usize, failed: usize, total: usize },
    /// Terminal record for a run that died before producing a summary
    Failed { error: String },
}

/// Final counts of a repair run
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RepairSummary {
    pub ok: usize,
    pub failed: usize,
    pub total: usize,
}

/// Produces watermarked WebP thumbnails from originals, with per-file retry
/// and a gap-detection/repair mode spanning both storage layouts.
pub struct ThumbnailPipeline {
    originals: Arc<dyn ObjectStore>,
    derived: Arc<dyn ObjectStore>,
    config: ThumbnailConfig,
    watermark: Option<DynamicImage>,
}

impl ThumbnailPipeline {
    pub fn new(
        originals: Arc<dyn ObjectStore>,
        derived: Arc<dyn ObjectStore>,
        config: ThumbnailConfig,
        watermark: Option<DynamicImage>,
    ) -> Self {
        Self {
            originals,
            derived,
            config,
            watermark,
        }
    }

    /// Fetch and decode the configured watermark tile, if any
    pub async fn load_watermark(
        derived: &dyn ObjectStore,
        config: &ThumbnailConfig,
    ) -> Option<DynamicImage> {
        let key = config.watermark_key.as_deref()?;
        match derived.download(key).await {
            Ok(bytes) => match image::load_from_memory(&bytes) {
                Ok(img) => {
                    info!(key = %key, "Watermark tile loaded");
                    Some(img)
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Watermark tile is not a decodable image");
                    None
                }
            },
            Err(e) => {
                warn!(key = %key, error = %e, "Watermark tile not available");
                None
            }
        }
    }

    /// Generate one thumbnail for a bare filename, trying the current layout
    /// path first and the legacy path when the current one is absent.
    #[instrument(skip(self))]
    pub async fn generate_for_file(&self, slug: &str, file: &str) -> Result<()> {
        let current = layout::original_key(Layout::Current, slug, file);
        let bytes = match self.originals.download(&current).await {
            Ok(bytes) => bytes,
            Err(PipelineError::NotFound(_)) => {
                let legacy = layout::original_key(Layout::Legacy, slug, file);
                self.originals.download(&legacy).await?
            }
            Err(e) => return Err(e),
        };

        self.render_and_upload(slug, file, bytes).await
    }

    async fn render_and_upload(&self, slug: &str, original_key: &str, bytes: Bytes) -> Result<()> {
        let thumb_key = layout::thumb_key_for(slug, original_key);
        let watermark = self.watermark.clone();
        let max_width = self.config.max_width;
        let quality = self.config.quality;

        // Decode/resize/encode is CPU-bound; keep it off the runtime threads
        let encoded = tokio::task::spawn_blocking(move || {
            render_thumbnail(&bytes, watermark.as_ref(), max_width, quality)
        })
        .await
        .map_err(|e| PipelineError::remote("thumbnailer", e))??;

        self.derived
            .upload(&thumb_key, Bytes::from(encoded), "image/webp")
            .await?;

        debug!(thumb_key = %thumb_key, "Thumbnail uploaded");
        metrics::counter!("pipeline.thumbs.generated").increment(1);

        Ok(())
    }

    /// Original keys whose expected derived basename is absent from the
    /// derived namespace
    #[instrument(skip(self))]
    pub async fn find_missing(&self, slug: &str) -> Result<Vec<String>> {
        let (_, originals) = resolve_originals(self.originals.as_ref(), slug).await?;
        let thumbs = self.derived.list(&layout::thumb_prefix(slug)).await?;
        Ok(missing_thumbs(&originals, &thumbs))
    }

    /// Repair every missing thumbnail for an event, sequentially, each file
    /// wrapped in bounded exponential-backoff retry.
    ///
    /// Progress records are pushed to `progress` as they occur; when the
    /// receiver goes away (caller disconnect) no new files are started.
    /// Completed uploads are never rolled back; a rerun resumes safely.
    #[instrument(skip(self, progress, cancel))]
    pub async fn repair(
        &self,
        slug: &str,
        attempts_override: Option<u32>,
        progress: mpsc::Sender<RepairEvent>,
        cancel: CancellationToken,
    ) -> Result<RepairSummary> {
        let missing = match self.find_missing(slug).await {
            Ok(missing) => missing,
            Err(e) => {
                // A streaming caller always gets a terminal record, even
                // when the run dies before the first file.
                let _ = progress
                    .send(RepairEvent::Failed { error: e.to_string() })
                    .await;
                return Err(e);
            }
        };
        let attempts = attempts_override.unwrap_or(self.config.repair_attempts).max(1);

        let mut summary = RepairSummary {
            total: missing.len(),
            ..Default::default()
        };

        let _ = progress
            .send(RepairEvent::Started {
                slug: slug.to_string(),
                missing: missing.len(),
            })
            .await;

        info!(slug = %slug, missing = missing.len(), attempts, "Thumbnail repair started");

        let mut done = 0usize;

        for original_key in &missing {
            if cancel.is_cancelled() {
                info!(slug = %slug, done, "Repair cancelled, stopping before next file");
                break;
            }

            let file = layout::basename(original_key).to_string();

            match self
                .repair_one(slug, original_key, attempts, &progress)
                .await
            {
                Ok(()) => {
                    summary.ok += 1;
                    if progress
                        .send(RepairEvent::FileOk { file })
                        .await
                        .is_err()
                    {
                        // Receiver dropped: the caller is gone, stop starting
                        // new files.
                        break;
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(slug = %slug, key = %original_key, error = %e, "Thumbnail repair exhausted retries");
                    metrics::counter!("pipeline.thumbs.repair_failed").increment(1);
                    if progress
                        .send(RepairEvent::FileFailed {
                            file,
                            error: e.to_string(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }

            done += 1;
            let _ = progress
                .send(RepairEvent::Progress {
                    done,
                    total: summary.total,
                    ok: summary.ok,
                    failed: summary.failed,
                })
                .await;
        }

        let _ = progress
            .send(RepairEvent::Done {
                ok: summary.ok,
                failed: summary.failed,
                total: summary.total,
            })
            .await;

        info!(
            slug = %slug,
            ok = summary.ok,
            failed = summary.failed,
            total = summary.total,
            "Thumbnail repair finished"
        );

        Ok(summary)
    }

    /// One file's bounded retry loop: base delay doubling per attempt up to
    /// the attempt ceiling
    async fn repair_one(
        &self,
        slug: &str,
        original_key: &str,
        attempts: u32,
        progress: &mpsc::Sender<RepairEvent>,
    ) -> Result<()> {
        let file = layout::basename(original_key).to_string();

        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.retry_base_ms),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_err = None;

        for attempt in 1..=attempts {
            let _ = progress
                .send(RepairEvent::Attempt {
                    file: file.clone(),
                    attempt,
                })
                .await;

            match self.originals.download(original_key).await {
                Ok(bytes) => match self.render_and_upload(slug, original_key, bytes).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last_err = Some(e),
                },
                // The original vanished between listing and download:
                // nothing to repair.
                Err(PipelineError::NotFound(_)) => return Ok(()),
                Err(e) => last_err = Some(e),
            }

            if attempt < attempts {
                if let Some(delay) = backoff.next_backoff() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            PipelineError::remote("thumbnailer", "retry loop ended without an error")
        }))
    }
}

/// Set difference on extension-stripped basenames: every original whose
/// expected derived basename is absent from the derived set. Case-sensitive.
pub fn missing_thumbs(originals: &[String], thumbs: &[String]) -> Vec<String> {
    let present: HashSet<&str> = thumbs.iter().map(|k| layout::stem(k)).collect();

    originals
        .iter()
        .filter(|key| !present.contains(layout::stem(key)))
        .cloned()
        .collect()
}

/// Decode, normalize orientation, bound width (never upscale), composite the
/// tiling watermark, and encode to WebP.
pub fn render_thumbnail(
    original: &[u8],
    watermark: Option<&DynamicImage>,
    max_width: u32,
    quality: f32,
) -> Result<Vec<u8>> {
    let orientation = exif_orientation(original);

    let img = image::load_from_memory(original)
        .map_err(|e| PipelineError::InvalidInput(format!("undecodable image: {e}")))?;

    let img = apply_orientation(img, orientation);

    let img = if img.width() > max_width {
        img.resize(max_width, u32::MAX, FilterType::Lanczos3)
    } else {
        img
    };

    let mut canvas = img.to_rgba8();

    if let Some(wm) = watermark {
        let tile = wm.to_rgba8();
        let (tw, th) = (tile.width().max(1), tile.height().max(1));
        let mut y = 0u32;
        while y < canvas.height() {
            let mut x = 0u32;
            while x < canvas.width() {
                image::imageops::overlay(&mut canvas, &tile, i64::from(x), i64::from(y));
                x += tw;
            }
            y += th;
        }
    }

    let encoder = webp::Encoder::from_rgba(&canvas, canvas.width(), canvas.height());
    let encoded = encoder.encode(quality);

    Ok(encoded.to_vec())
}

/// EXIF orientation value of the image, when present
fn exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = std::io::Cursor::new(bytes);
    exif::Reader::new()
        .read_from_container(&mut cursor)
        .ok()
        .and_then(|data| {
            data.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .unwrap_or(1)
}

/// Rotate/flip per the EXIF orientation specification
fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.fliph().rotate270(),
        6 => img.rotate90(),
        7 => img.fliph().rotate90(),
        8 => img.rotate270(),
        _ => img,
    }
}
