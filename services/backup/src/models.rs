use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Records that can come back empty when the vendor has nothing eligible yet
pub trait BlankRecord {
    /// True when the record carries no usable backup
    fn is_blank(&self) -> bool;
}

/// Latest Alibaba Cloud RDS backup of an instance.
///
/// Field names double as the `DescribeBackups` item keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    #[serde(rename = "BackupStartTime", default)]
    pub start_time: String,
    #[serde(rename = "BackupDownloadURL", default)]
    pub download_url: String,
    #[serde(rename = "BackupIntranetDownloadURL", default)]
    pub intranet_download_url: String,
}

impl BlankRecord for BackupRecord {
    fn is_blank(&self) -> bool {
        self.download_url.is_empty() && self.intranet_download_url.is_empty()
    }
}

/// Latest available AWS RDS automated snapshot of an instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    #[serde(rename = "SnapshotArn")]
    pub arn: String,
    #[serde(rename = "SnapshotCreateTime")]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(rename = "SnapshotId")]
    pub id: String,
    #[serde(rename = "Status")]
    pub status: String,
}

impl BlankRecord for SnapshotRecord {
    fn is_blank(&self) -> bool {
        self.arn.is_empty()
    }
}

/// Object written by the streaming uploader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub key: String,
    pub location: String,
}

/// Snapshot export task accepted by RDS. Completion is not tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportTask {
    pub id: String,
    pub source_arn: String,
    pub bucket: String,
    pub prefix: String,
}

/// Deterministic object key of a copied backup:
/// `{environment}/backup-{environment}-{yyyyMMdd-HHmmss}.xb`
pub fn backup_object_key(environment: &str, at: DateTime<Utc>) -> String {
    format!(
        "{env}/backup-{env}-{timestamp}.xb",
        env = environment,
        timestamp = at.format("%Y%m%d-%H%M%S")
    )
}
