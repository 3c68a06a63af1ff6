//! Revela Media Pipeline
//!
//! Event media and identity pipeline for the Revela event-photography
//! platform. The service keeps four independently-failing backends in a
//! consistent and recoverable state while photos are ingested, indexed,
//! searched, and expired: the originals bucket, the derived-previews
//! bucket, PostgreSQL metadata, and the Rekognition face index.
//!
//! ## Components
//!
//! - **Face Indexer**: idempotent ingestion of an event's photos into its
//!   biometric collection, one state row per (event, photo) pair
//! - **Thumbnail Pipeline**: watermarked WebP generation with per-file
//!   retry/backoff and gap repair across the legacy and current layouts
//! - **Identity Search**: selfie face detection + bounded-concurrent
//!   comparison against indexed photos, threshold-filtered and ranked
//! - **Lifecycle Reaper**: scheduled cascading delete of expired events
//!   across all backends, best-effort per step, event row last
//!
//! ## Architecture
//!
//! ```text
//! S3 originals                Rekognition              PostgreSQL
//! ┌────────────────┐         ┌──────────────┐         ┌──────────────────┐
//! │ eventos/{slug}/│────────▶│ collection   │         │ events           │
//! │   original/    │ index   │   {slug}     │         │ indexed_faces    │
//! │ {slug}/ legacy │         └──────────────┘         │ photo_index_state│
//! └────────────────┘                ▲                 └──────────────────┘
//!         │                         │ compare                  ▲
//!         ▼ render                  │                          │
//! ┌────────────────┐         ┌──────────────┐                  │
//! │ S3 derived     │         │ Identity     │──────────────────┘
//! │ eventos/{slug}/│         │ Search       │
//! │   thumb/*.webp │         └──────────────┘
//! └────────────────┘
//!         ▲                  ┌──────────────┐
//!         └──────────────────│ Lifecycle    │── deletes everything above
//!             gap repair     │ Reaper       │   for expired events
//!                            └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod face_index;
pub mod indexer;
pub mod layout;
pub mod metadata_store;
pub mod object_store;
pub mod reaper;
pub mod search;
pub mod thumbnails;

pub use api::{AppState, SECRET_HEADER};
pub use config::Config;
pub use error::{PipelineError, Result};
pub use face_index::{BiometricIndex, BoundingBox, FaceRecord, RekognitionIndex, S3Ref};
pub use indexer::{FaceIndexer, IndexOutcome};
pub use layout::Layout;
pub use metadata_store::{Event, IndexedFace, MetadataStore, PgMetadataStore};
pub use object_store::{ObjectStore, S3ObjectStore};
pub use reaper::{LifecycleReaper, ReapSummary};
pub use search::{IdentitySearch, SearchMatch};
pub use thumbnails::{RepairEvent, RepairSummary, ThumbnailPipeline};
