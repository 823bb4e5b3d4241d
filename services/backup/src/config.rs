use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Smallest part S3 accepts for every part but the last
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Largest part S3 accepts
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Main configuration for the backup service
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Outbound HTTP timeouts
    #[serde(default)]
    pub http: HttpConfig,
    /// Backup query retry policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// Streaming upload tuning
    #[serde(default)]
    pub upload: UploadConfig,
    /// Alibaba Cloud RDS instances and S3 copy destination
    #[serde(default)]
    pub aliyun: AliyunConfig,
    /// AWS RDS instances and snapshot export settings
    #[serde(default)]
    pub aws: AwsConfig,
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

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Timeouts applied to every outbound call
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Maximum idle time between two reads of a response body
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Overall deadline for vendor API calls. Not applied to backup downloads.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per query, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts
    #[serde(default = "default_retry_delay_secs")]
    pub delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Part size for multipart uploads in bytes (200MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: u64,
    /// Number of parts uploaded in parallel
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,
    /// Copy from the intranet download URL instead of the public one
    #[serde(default)]
    pub prefer_intranet_url: bool,
}

/// Alibaba Cloud RDS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AliyunConfig {
    /// RDS OpenAPI endpoint
    #[serde(default = "default_aliyun_endpoint")]
    pub endpoint: String,
    /// Falls back to ALIBABA_CLOUD_ACCESS_KEY_ID
    pub access_key_id: Option<String>,
    /// Falls back to ALIBABA_CLOUD_ACCESS_KEY_SECRET
    pub access_key_secret: Option<String>,
    /// Environment name -> instance
    #[serde(default)]
    pub instances: HashMap<String, InstanceConfig>,
    /// Destination of backup copies
    #[serde(default)]
    pub s3_export: S3ExportConfig,
}

/// S3 destination for Alibaba backup copies
#[derive(Debug, Clone, Deserialize, Default)]
pub struct S3ExportConfig {
    /// AWS region of the bucket
    #[serde(default)]
    pub region: String,
    /// Destination bucket
    #[serde(default)]
    pub bucket_name: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// AWS RDS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// Page size of the snapshot listing; later pages are not read
    #[serde(default = "default_snapshot_page_size")]
    pub snapshot_page_size: i32,
    /// Environment name -> instance
    #[serde(default)]
    pub instances: HashMap<String, InstanceConfig>,
    #[serde(default)]
    pub export_task: ExportTaskConfig,
}

/// Settings shared by every snapshot export task
#[derive(Debug, Clone, Deserialize)]
pub struct ExportTaskConfig {
    /// Key prefix inside the destination bucket
    #[serde(default)]
    pub s3_prefix: String,
    /// Role assumed by RDS to write into the bucket
    #[serde(default)]
    pub iam_role_arn: String,
    /// First segment of generated export task identifiers
    #[serde(default = "default_identifier_prefix")]
    pub identifier_prefix: String,
}

/// A single database instance bound to an environment name
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Vendor instance identifier
    pub id: String,
    #[serde(default)]
    pub region: String,
    /// KMS key used by snapshot exports (AWS only)
    #[serde(default)]
    pub kms_key_id: String,
    /// Export destination bucket (AWS only)
    #[serde(default)]
    pub s3_bucket_name: String,
}

// Default value functions
fn default_service_name() -> String {
    "backup-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_delay_secs() -> u64 {
    2
}

fn default_part_size() -> u64 {
    200 * 1024 * 1024 // 200MB
}

fn default_upload_concurrency() -> usize {
    10
}

fn default_aliyun_endpoint() -> String {
    "rds.aliyuncs.com".to_string()
}

fn default_snapshot_page_size() -> i32 {
    20
}

fn default_identifier_prefix() -> String {
    "exp".to_string()
}

impl Config {
    /// Load configuration from defaults, config files and the environment.
    ///
    /// An explicit `path` replaces the default file locations and must exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("service.name", "backup-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?;

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder
                .add_source(config::File::with_name("config/backup").required(false))
                .add_source(config::File::with_name("/etc/backuprds/backup").required(false)),
        };

        let config: Config = builder
            // BACKUP__ALIYUN__S3_EXPORT__BUCKET_NAME -> aliyun.s3_export.bucket_name
            .add_source(
                config::Environment::with_prefix("BACKUP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the uploader or retry loop cannot honour
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.upload.concurrency == 0 {
            anyhow::bail!("upload.concurrency must be at least 1");
        }
        if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&self.upload.part_size_bytes) {
            anyhow::bail!(
                "upload.part_size_bytes must be between {} and {}",
                MIN_PART_SIZE,
                MAX_PART_SIZE
            );
        }
        Ok(())
    }

    /// Alibaba credentials from config, falling back to the SDK environment variables
    pub fn aliyun_credentials(&self) -> Option<(String, String)> {
        let id = self
            .aliyun
            .access_key_id
            .clone()
            .or_else(|| std::env::var("ALIBABA_CLOUD_ACCESS_KEY_ID").ok())
            .filter(|v| !v.is_empty())?;
        let secret = self
            .aliyun
            .access_key_secret
            .clone()
            .or_else(|| std::env::var("ALIBABA_CLOUD_ACCESS_KEY_SECRET").ok())
            .filter(|v| !v.is_empty())?;
        Some((id, secret))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.http.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.http.read_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry.delay_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_secs: default_retry_delay_secs(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size_bytes: default_part_size(),
            concurrency: default_upload_concurrency(),
            prefer_intranet_url: false,
        }
    }
}

impl Default for AliyunConfig {
    fn default() -> Self {
        Self {
            endpoint: default_aliyun_endpoint(),
            access_key_id: None,
            access_key_secret: None,
            instances: HashMap::new(),
            s3_export: S3ExportConfig::default(),
        }
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            snapshot_page_size: default_snapshot_page_size(),
            instances: HashMap::new(),
            export_task: ExportTaskConfig::default(),
        }
    }
}

impl Default for ExportTaskConfig {
    fn default() -> Self {
        Self {
            s3_prefix: String::new(),
            iam_role_arn: String::new(),
            identifier_prefix: default_identifier_prefix(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.retry_delay(), Duration::from_secs(2));
        assert_eq!(config.upload.part_size_bytes, 200 * 1024 * 1024);
        assert_eq!(config.upload.concurrency, 10);
        assert_eq!(config.aliyun.endpoint, "rds.aliyuncs.com");
        assert_eq!(config.aws.snapshot_page_size, 20);
        assert_eq!(config.aws.export_task.identifier_prefix, "exp");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_small_parts() {
        let mut config = Config::default();
        config.upload.part_size_bytes = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_part_size_bounds() {
        let mut config = Config::default();
        config.upload.part_size_bytes = MAX_PART_SIZE;
        assert!(config.validate().is_ok());

        config.upload.part_size_bytes = MAX_PART_SIZE + 1;
        assert!(config.validate().is_err());

        config.upload.part_size_bytes = MIN_PART_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_yaml() {
        let yaml = r#"
retry:
  max_attempts: 3
aliyun:
  instances:
    prod:
      id: rm-bp1234567890
  s3_export:
    region: ap-southeast-1
    bucket_name: dr-backups
aws:
  instances:
    staging:
      id: staging-db
      region: us-west-2
      kms_key_id: alias/rds-export
      s3_bucket_name: staging-exports
  export_task:
    s3_prefix: exports
    iam_role_arn: arn:aws:iam::123456789012:role/rds-export
"#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay_secs, 2);
        assert_eq!(config.aliyun.instances["prod"].id, "rm-bp1234567890");
        assert_eq!(config.aliyun.s3_export.bucket_name, "dr-backups");
        let staging = &config.aws.instances["staging"];
        assert_eq!(staging.region, "us-west-2");
        assert_eq!(staging.kms_key_id, "alias/rds-export");
        assert_eq!(config.aws.export_task.identifier_prefix, "exp");
    }

    #[test]
    fn test_load_sample_file() {
        let path = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/config/backup.yaml"));
        let config = Config::load(Some(path)).unwrap();

        assert_eq!(config.api.port, 8080);
        assert_eq!(config.aliyun.instances.len(), 2);
        assert_eq!(config.aws.instances["prod"].region, "ap-southeast-1");
        assert_eq!(config.aws.export_task.s3_prefix, "exports");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/backup.yaml"))).is_err());
    }

    #[test]
    fn test_configured_aliyun_credentials() {
        let mut config = Config::default();
        config.aliyun.access_key_id = Some("id".to_string());
        config.aliyun.access_key_secret = Some("secret".to_string());
        assert_eq!(
            config.aliyun_credentials(),
            Some(("id".to_string(), "secret".to_string()))
        );
    }
}
