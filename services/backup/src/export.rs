use crate::error::BackupError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// RDS rejects export task identifiers built from longer instance names
const SHORT_INSTANCE_ID_LEN: usize = 20;

/// Everything needed to start one snapshot export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub task_id: String,
    pub instance_id: String,
    pub snapshot_arn: String,
    pub region: String,
    pub iam_role_arn: String,
    pub kms_key_id: String,
    pub bucket: String,
    pub prefix: String,
}

impl ExportRequest {
    /// Build a request with a generated task identifier and normalized prefix
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identifier_prefix: &str,
        instance_id: &str,
        snapshot_arn: &str,
        region: &str,
        iam_role_arn: &str,
        kms_key_id: &str,
        bucket: &str,
        prefix: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: export_task_id(identifier_prefix, instance_id, at),
            instance_id: instance_id.to_string(),
            snapshot_arn: snapshot_arn.to_string(),
            region: region.to_string(),
            iam_role_arn: iam_role_arn.to_string(),
            kms_key_id: kms_key_id.to_string(),
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }
}

/// Starts snapshot export tasks. Called once per export, never retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotExporter: Send + Sync {
    /// Returns the task identifier confirmed by the vendor
    async fn start_export(&self, request: &ExportRequest) -> Result<String, BackupError>;
}

/// Last colon-delimited segment of an instance identifier, cut to its last 20 characters
pub fn short_instance_id(instance_id: &str) -> &str {
    let segment = instance_id.rsplit(':').next().unwrap_or(instance_id);
    let len = segment.chars().count();
    if len <= SHORT_INSTANCE_ID_LEN {
        return segment;
    }
    match segment.char_indices().nth(len - SHORT_INSTANCE_ID_LEN) {
        Some((offset, _)) => &segment[offset..],
        None => segment,
    }
}

/// `{prefix}-{short instance id}-{MMdd-HHmm}`, unique per instance per minute
pub fn export_task_id(identifier_prefix: &str, instance_id: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}",
        identifier_prefix,
        short_instance_id(instance_id),
        at.format("%m%d-%H%M")
    )
}

/// Exactly one trailing `/`; an empty prefix stays empty
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}
