use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the media pipeline service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// S3 configuration (originals + derived buckets)
    pub s3: S3Config,
    /// Rekognition configuration
    pub rekognition: RekognitionConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Thumbnail generation configuration
    pub thumbnails: ThumbnailConfig,
    /// Lifecycle reaper configuration
    pub reaper: ReaperConfig,
    /// API configuration
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding original photos
    pub originals_bucket: String,
    /// Bucket holding derived previews (may equal the originals bucket)
    pub derived_bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Presigned upload URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Timeout applied to every S3 call, in seconds
    #[serde(default = "default_remote_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum keys per delete-objects batch
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,
}

/// Rekognition (biometric index) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RekognitionConfig {
    /// AWS region for Rekognition
    #[serde(default = "default_region")]
    pub region: String,
    /// Similarity threshold for selfie matches (percent)
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Maximum face ids per delete-faces batch (service ceiling is 1000)
    #[serde(default = "default_face_delete_batch_size")]
    pub face_delete_batch_size: usize,
    /// Bounded concurrency for per-photo comparisons during search
    #[serde(default = "default_search_concurrency")]
    pub search_concurrency: usize,
    /// Timeout applied to every Rekognition call, in seconds
    #[serde(default = "default_remote_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Timeout applied to every statement, in seconds
    #[serde(default = "default_remote_timeout_secs")]
    pub statement_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Thumbnail generation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailConfig {
    /// Maximum thumbnail width in pixels (originals are never upscaled)
    #[serde(default = "default_thumb_width")]
    pub max_width: u32,
    /// WebP encoding quality (0-100)
    #[serde(default = "default_thumb_quality")]
    pub quality: f32,
    /// Object key of the watermark tile, looked up in the derived bucket
    pub watermark_key: Option<String>,
    /// Attempt ceiling for per-file repair retries
    #[serde(default = "default_repair_attempts")]
    pub repair_attempts: u32,
    /// Base delay for exponential backoff between attempts, in milliseconds
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

/// Lifecycle reaper configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    /// Maximum expired events processed per run
    #[serde(default = "default_reap_batch_size")]
    pub batch_size: i64,
    /// Interval between scheduled runs, in seconds
    #[serde(default = "default_reap_interval_secs")]
    pub interval_secs: u64,
    /// Enable the in-process scheduler (disable when an external cron drives /reap)
    #[serde(default = "default_true")]
    pub scheduler_enabled: bool,
}

/// API configuration for the admin/cron surface
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Shared secret required on admin and cron routes
    pub admin_secret: String,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "revela-pipeline".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_remote_timeout_secs() -> u64 {
    30
}

fn default_delete_batch_size() -> usize {
    1000
}

fn default_similarity_threshold() -> f32 {
    90.0
}

fn default_face_delete_batch_size() -> usize {
    1000
}

fn default_search_concurrency() -> usize {
    8
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_thumb_width() -> u32 {
    1600
}

fn default_thumb_quality() -> f32 {
    80.0
}

fn default_repair_attempts() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_reap_batch_size() -> i64 {
    20
}

fn default_reap_interval_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "revela-pipeline")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/pipeline").required(false))
            .add_source(config::File::with_name("/etc/revela/pipeline").required(false))
            // Override with environment variables
            // REVELA__S3__ORIGINALS_BUCKET -> s3.originals_bucket
            .add_source(
                config::Environment::with_prefix("REVELA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }

    /// Get reaper scheduling interval as Duration
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reaper.interval_secs)
    }
}
