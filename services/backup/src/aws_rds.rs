use crate::error::BackupError;
use crate::export::{ExportRequest, SnapshotExporter};
use crate::models::SnapshotRecord;
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_types::SdkConfig;
use aws_sdk_rds::error::DisplayErrorContext;
use aws_sdk_rds::primitives::DateTime as SmithyDateTime;
use aws_sdk_rds::types::DbSnapshot;
use aws_sdk_rds::Client as RdsClient;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const AVAILABLE: &str = "available";

/// Looks up the most recent usable snapshot of an RDS instance
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotQuerier: Send + Sync {
    /// Latest available snapshot, or a blank record when none is available
    async fn latest_snapshot(
        &self,
        instance_id: &str,
        region: &str,
    ) -> Result<SnapshotRecord, BackupError>;
}

/// AWS RDS client holding one SDK client per configured region
pub struct AwsRdsClient {
    clients: HashMap<String, RdsClient>,
    page_size: i32,
}

impl AwsRdsClient {
    /// Create one RDS client per region from a shared SDK configuration.
    ///
    /// `operation_timeout` bounds every call including its retries.
    pub fn new(
        sdk_config: &SdkConfig,
        regions: &[String],
        page_size: i32,
        operation_timeout: Duration,
    ) -> Self {
        let clients = regions
            .iter()
            .map(|region| {
                let config = aws_sdk_rds::config::Builder::from(sdk_config)
                    .region(aws_config::Region::new(region.clone()))
                    .timeout_config(
                        TimeoutConfig::builder()
                            .operation_timeout(operation_timeout)
                            .build(),
                    )
                    .build();
                (region.clone(), RdsClient::from_conf(config))
            })
            .collect::<HashMap<_, _>>();

        info!(
            regions = ?regions,
            page_size,
            operation_timeout_secs = operation_timeout.as_secs(),
            "AWS RDS clients initialized"
        );

        Self::from_clients(clients, page_size)
    }

    /// Use prebuilt clients keyed by region
    pub fn from_clients(clients: HashMap<String, RdsClient>, page_size: i32) -> Self {
        Self { clients, page_size }
    }

    fn client(&self, operation: &'static str, region: &str) -> Result<&RdsClient, BackupError> {
        self.clients.get(region).ok_or_else(|| {
            BackupError::upstream(operation, format!("no RDS client configured for region {region}"))
        })
    }
}

#[async_trait]
impl SnapshotQuerier for AwsRdsClient {
    #[instrument(skip(self))]
    async fn latest_snapshot(
        &self,
        instance_id: &str,
        region: &str,
    ) -> Result<SnapshotRecord, BackupError> {
        let client = self.client("DescribeDBSnapshots", region)?;

        let response = client
            .describe_db_snapshots()
            .db_instance_identifier(instance_id)
            .snapshot_type("automated")
            .max_records(self.page_size)
            .include_shared(true)
            .include_public(true)
            .send()
            .await
            .map_err(|e| {
                BackupError::upstream(
                    "DescribeDBSnapshots",
                    format!("{} (instanceID: {})", DisplayErrorContext(&e), instance_id),
                )
            })?;

        let snapshots = response.db_snapshots();
        debug!(count = snapshots.len(), instance_id, "Found snapshots");

        let latest = select_latest_available(snapshots.iter().map(SnapshotRecord::from));
        if latest.arn.is_empty() {
            warn!(instance_id, region, "No available snapshots found");
        }
        Ok(latest)
    }
}

#[async_trait]
impl SnapshotExporter for AwsRdsClient {
    #[instrument(skip(self, request), fields(task_id = %request.task_id, instance_id = %request.instance_id))]
    async fn start_export(&self, request: &ExportRequest) -> Result<String, BackupError> {
        let client = self.client("StartExportTask", &request.region)?;

        info!(
            source_arn = %request.snapshot_arn,
            bucket = %request.bucket,
            prefix = %request.prefix,
            "Starting export task"
        );

        let response = client
            .start_export_task()
            .export_task_identifier(&request.task_id)
            .source_arn(&request.snapshot_arn)
            .iam_role_arn(&request.iam_role_arn)
            .kms_key_id(&request.kms_key_id)
            .s3_bucket_name(&request.bucket)
            .s3_prefix(&request.prefix)
            .send()
            .await
            .map_err(|e| {
                BackupError::upstream("StartExportTask", DisplayErrorContext(&e).to_string())
            })?;

        Ok(response
            .export_task_identifier()
            .unwrap_or(&request.task_id)
            .to_string())
    }
}

impl From<&DbSnapshot> for SnapshotRecord {
    fn from(snapshot: &DbSnapshot) -> Self {
        Self {
            arn: snapshot.db_snapshot_arn().unwrap_or_default().to_string(),
            create_time: snapshot.snapshot_create_time().and_then(to_chrono),
            id: snapshot.db_snapshot_identifier().unwrap_or_default().to_string(),
            status: snapshot.status().unwrap_or_default().to_string(),
        }
    }
}

fn to_chrono(time: &SmithyDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(time.secs(), time.subsec_nanos())
}

/// The available snapshot with the latest creation time, or a blank record.
///
/// Snapshots sharing the latest creation time resolve to the first one listed.
pub fn select_latest_available<I>(snapshots: I) -> SnapshotRecord
where
    I: IntoIterator<Item = SnapshotRecord>,
{
    snapshots
        .into_iter()
        .filter(|snapshot| snapshot.status == AVAILABLE)
        .reduce(|best, snapshot| {
            if snapshot.create_time > best.create_time {
                snapshot
            } else {
                best
            }
        })
        .unwrap_or_default()
}
