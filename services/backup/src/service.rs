//! Backup workflows behind the HTTP API.
//!
//! Every operation resolves the environment first, so an unknown environment
//! never reaches a vendor API.

use crate::aliyun::BackupQuerier;
use crate::aws_rds::SnapshotQuerier;
use crate::config::{Config, ExportTaskConfig, InstanceConfig, S3ExportConfig};
use crate::error::BackupError;
use crate::export::{ExportRequest, SnapshotExporter};
use crate::models::{BackupRecord, ExportTask, SnapshotRecord, UploadResult};
use crate::registry::{InstanceRegistry, Provider};
use crate::retry::{QueryOutcome, RetryPolicy};
use crate::uploader::StreamingUploader;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct BackupService {
    registry: InstanceRegistry,
    backups: Arc<dyn BackupQuerier>,
    snapshots: Arc<dyn SnapshotQuerier>,
    exporter: Arc<dyn SnapshotExporter>,
    uploader: Arc<StreamingUploader>,
    retry: RetryPolicy,
    export_task: ExportTaskConfig,
    s3_export: S3ExportConfig,
    prefer_intranet_url: bool,
}

impl BackupService {
    pub fn new(
        config: &Config,
        backups: Arc<dyn BackupQuerier>,
        snapshots: Arc<dyn SnapshotQuerier>,
        exporter: Arc<dyn SnapshotExporter>,
        uploader: Arc<StreamingUploader>,
    ) -> Self {
        Self {
            registry: InstanceRegistry::from_config(config),
            backups,
            snapshots,
            exporter,
            uploader,
            retry: RetryPolicy::new(config.retry.max_attempts, config.retry_delay()),
            export_task: config.aws.export_task.clone(),
            s3_export: config.aliyun.s3_export.clone(),
            prefer_intranet_url: config.upload.prefer_intranet_url,
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Destination of Alibaba backup copies; both region and bucket must be set
    pub fn s3_export_config(&self) -> Result<&S3ExportConfig, BackupError> {
        if self.s3_export.region.is_empty() || self.s3_export.bucket_name.is_empty() {
            return Err(BackupError::MissingConfig(
                "aliyun.s3_export.region and aliyun.s3_export.bucket_name".to_string(),
            ));
        }
        Ok(&self.s3_export)
    }

    /// Latest Alibaba backup of `environment`, retried per policy
    #[instrument(skip(self))]
    pub async fn latest_backup(
        &self,
        environment: &str,
    ) -> Result<QueryOutcome<BackupRecord>, BackupError> {
        let instance = self.registry.lookup(environment, Provider::Aliyun)?;
        Ok(self.query_backup(instance).await)
    }

    /// Latest available AWS snapshot of `environment`, retried per policy
    #[instrument(skip(self))]
    pub async fn latest_snapshot(
        &self,
        environment: &str,
    ) -> Result<(&InstanceConfig, QueryOutcome<SnapshotRecord>), BackupError> {
        let instance = self.registry.lookup(environment, Provider::Aws)?;
        Ok((instance, self.query_snapshot(instance).await))
    }

    /// Export the latest available snapshot of `environment` to its bucket.
    ///
    /// The snapshot lookup is retried; the export call itself is made once.
    #[instrument(skip(self))]
    pub async fn start_snapshot_export(
        &self,
        environment: &str,
    ) -> Result<(&InstanceConfig, QueryOutcome<ExportTask>), BackupError> {
        let instance = self.registry.lookup(environment, Provider::Aws)?;
        self.validate_export(instance)?;

        let outcome = match self.query_snapshot(instance).await {
            QueryOutcome::Found { record, attempts } => {
                let request = ExportRequest::new(
                    &self.export_task.identifier_prefix,
                    &instance.id,
                    &record.arn,
                    &instance.region,
                    &self.export_task.iam_role_arn,
                    &instance.kms_key_id,
                    &instance.s3_bucket_name,
                    &self.export_task.s3_prefix,
                    Utc::now(),
                );

                match self.exporter.start_export(&request).await {
                    Ok(task_id) => {
                        metrics::counter!("backup.export.started").increment(1);
                        info!(
                            task_id = %task_id,
                            instance_id = %instance.id,
                            region = %instance.region,
                            "Export task started"
                        );
                        QueryOutcome::Found {
                            record: ExportTask {
                                id: task_id,
                                source_arn: request.snapshot_arn,
                                bucket: request.bucket,
                                prefix: request.prefix,
                            },
                            attempts,
                        }
                    }
                    Err(error) => {
                        warn!(error = %error, instance_id = %instance.id, "Failed to start export task");
                        QueryOutcome::Failed { error, attempts }
                    }
                }
            }
            QueryOutcome::NotFound { attempts } => QueryOutcome::NotFound { attempts },
            QueryOutcome::Failed { error, attempts } => QueryOutcome::Failed { error, attempts },
        };
        Ok((instance, outcome))
    }

    /// Copy the latest Alibaba backup of `environment` into the S3 export bucket.
    ///
    /// Download and upload failures are reported as [`BackupError::Upload`].
    #[instrument(skip(self))]
    pub async fn copy_backup_to_s3(
        &self,
        environment: &str,
    ) -> Result<QueryOutcome<UploadResult>, BackupError> {
        let instance = self.registry.lookup(environment, Provider::Aliyun)?;
        let bucket = self.s3_export_config()?.bucket_name.clone();

        let outcome = match self.query_backup(instance).await {
            QueryOutcome::Found { record, attempts } => {
                let source_url = self.source_url(&record);
                match self
                    .uploader
                    .upload_from_url(source_url, &bucket, environment)
                    .await
                {
                    Ok(result) => QueryOutcome::Found {
                        record: result,
                        attempts,
                    },
                    Err(error) => QueryOutcome::Failed {
                        error: match error {
                            BackupError::Upload(_) => error,
                            other => BackupError::upload(other.to_string()),
                        },
                        attempts,
                    },
                }
            }
            QueryOutcome::NotFound { attempts } => QueryOutcome::NotFound { attempts },
            QueryOutcome::Failed { error, attempts } => QueryOutcome::Failed { error, attempts },
        };
        Ok(outcome)
    }

    fn validate_export(&self, instance: &InstanceConfig) -> Result<(), BackupError> {
        let missing = [
            ("aws.export_task.iam_role_arn", self.export_task.iam_role_arn.as_str()),
            ("kms_key_id", instance.kms_key_id.as_str()),
            ("s3_bucket_name", instance.s3_bucket_name.as_str()),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
        .collect::<Vec<_>>();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BackupError::MissingConfig(format!(
                "{} for instance {}",
                missing.join(", "),
                instance.id
            )))
        }
    }

    fn source_url<'a>(&self, record: &'a BackupRecord) -> &'a str {
        let intranet = record.intranet_download_url.as_str();
        if (self.prefer_intranet_url && !intranet.is_empty()) || record.download_url.is_empty() {
            intranet
        } else {
            &record.download_url
        }
    }

    async fn query_backup(&self, instance: &InstanceConfig) -> QueryOutcome<BackupRecord> {
        let outcome = self
            .retry
            .run("DescribeBackups", || self.backups.latest_backup(&instance.id))
            .await;
        record_outcome("DescribeBackups", instance, &outcome);
        outcome
    }

    async fn query_snapshot(&self, instance: &InstanceConfig) -> QueryOutcome<SnapshotRecord> {
        let outcome = self
            .retry
            .run("DescribeDBSnapshots", || {
                self.snapshots.latest_snapshot(&instance.id, &instance.region)
            })
            .await;
        record_outcome("DescribeDBSnapshots", instance, &outcome);
        outcome
    }
}

fn record_outcome<T>(operation: &'static str, instance: &InstanceConfig, outcome: &QueryOutcome<T>) {
    metrics::counter!(
        "backup.query.outcomes",
        "operation" => operation,
        "outcome" => outcome.label()
    )
    .increment(1);

    match outcome {
        QueryOutcome::Failed { error, attempts } => warn!(
            operation,
            instance_id = %instance.id,
            region = %instance.region,
            attempts,
            outcome = outcome.label(),
            error = %error,
            "Query finished"
        ),
        _ => info!(
            operation,
            instance_id = %instance.id,
            region = %instance.region,
            attempts = outcome.attempts(),
            outcome = outcome.label(),
            "Query finished"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aliyun::MockBackupQuerier;
    use crate::aws_rds::MockSnapshotQuerier;
    use crate::export::MockSnapshotExporter;
    use crate::uploader::MockObjectUploader;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    fn instance(id: &str, region: &str) -> InstanceConfig {
        InstanceConfig {
            id: id.to_string(),
            region: region.to_string(),
            kms_key_id: "alias/rds-export".to_string(),
            s3_bucket_name: "orders-exports".to_string(),
        }
    }

    fn create_test_config(max_attempts: u32) -> Config {
        let mut config = Config::default();
        config.retry.max_attempts = max_attempts;
        config.retry.delay_secs = 0;
        config
            .aliyun
            .instances
            .insert("prod".to_string(), instance("rm-prod", "cn-hangzhou"));
        config.aliyun.s3_export.region = "ap-southeast-1".to_string();
        config.aliyun.s3_export.bucket_name = "dr-backups".to_string();
        config
            .aws
            .instances
            .insert("prod".to_string(), instance("orders-db", "us-west-2"));
        config.aws.export_task.iam_role_arn = "arn:aws:iam::123456789012:role/rds-export".to_string();
        config.aws.export_task.s3_prefix = "exports".to_string();
        config
    }

    struct Mocks {
        backups: MockBackupQuerier,
        snapshots: MockSnapshotQuerier,
        exporter: MockSnapshotExporter,
        store: MockObjectUploader,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                backups: MockBackupQuerier::new(),
                snapshots: MockSnapshotQuerier::new(),
                exporter: MockSnapshotExporter::new(),
                store: MockObjectUploader::new(),
            }
        }

        fn into_service(self, config: &Config) -> BackupService {
            let uploader = StreamingUploader::new(
                reqwest::Client::new(),
                Arc::new(self.store),
                config.upload.part_size_bytes,
                config.upload.concurrency,
            );
            BackupService::new(
                config,
                Arc::new(self.backups),
                Arc::new(self.snapshots),
                Arc::new(self.exporter),
                Arc::new(uploader),
            )
        }
    }

    fn snapshot() -> SnapshotRecord {
        SnapshotRecord {
            arn: "arn:aws:rds:us-west-2:123456789012:snapshot:rds:orders-db-2024-03-20".to_string(),
            create_time: None,
            id: "rds:orders-db-2024-03-20".to_string(),
            status: "available".to_string(),
        }
    }

    fn backup(download_url: &str, intranet_download_url: &str) -> BackupRecord {
        BackupRecord {
            start_time: "2024-03-20T02:00:00Z".to_string(),
            download_url: download_url.to_string(),
            intranet_download_url: intranet_download_url.to_string(),
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_unknown_environment_makes_no_calls() {
        // Mocks without expectations panic when called
        let service = Mocks::new().into_service(&create_test_config(3));

        for result in [
            service.latest_backup("qa").await.map(|_| ()),
            service.copy_backup_to_s3("qa").await.map(|_| ()),
            service.latest_snapshot("qa").await.map(|_| ()),
            service.start_snapshot_export("qa").await.map(|_| ()),
        ] {
            assert!(matches!(
                result,
                Err(BackupError::UnknownEnvironment { ref environment, .. }) if environment == "qa"
            ));
        }
    }

    #[tokio::test]
    async fn test_latest_backup_retries_blank_results() {
        let mut mocks = Mocks::new();
        mocks.backups.expect_latest_backup().times(3).returning(|instance_id| {
            assert_eq!(instance_id, "rm-prod");
            Ok(BackupRecord::default())
        });
        let service = mocks.into_service(&create_test_config(3));

        let outcome = service.latest_backup("prod").await.unwrap();
        assert_eq!(outcome, QueryOutcome::NotFound { attempts: 3 });
    }

    #[tokio::test]
    async fn test_latest_snapshot_uses_instance_region() {
        let mut mocks = Mocks::new();
        mocks
            .snapshots
            .expect_latest_snapshot()
            .times(1)
            .returning(|instance_id, region| {
                assert_eq!(instance_id, "orders-db");
                assert_eq!(region, "us-west-2");
                Ok(snapshot())
            });
        let service = mocks.into_service(&create_test_config(3));

        let (instance, outcome) = service.latest_snapshot("prod").await.unwrap();
        assert_eq!(instance.region, "us-west-2");
        assert_eq!(
            outcome,
            QueryOutcome::Found {
                record: snapshot(),
                attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn test_export_requires_configuration() {
        let mut config = create_test_config(1);
        config.aws.export_task.iam_role_arn.clear();
        let service = Mocks::new().into_service(&config);

        let err = service.start_snapshot_export("prod").await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("iam_role_arn"));
    }

    #[tokio::test]
    async fn test_export_starts_task_for_latest_snapshot() {
        let mut mocks = Mocks::new();
        mocks
            .snapshots
            .expect_latest_snapshot()
            .times(1)
            .returning(|_, _| Ok(snapshot()));
        mocks.exporter.expect_start_export().times(1).returning(|request| {
            assert!(request.task_id.starts_with("exp-orders-db-"));
            assert_eq!(request.snapshot_arn, snapshot().arn);
            assert_eq!(request.iam_role_arn, "arn:aws:iam::123456789012:role/rds-export");
            assert_eq!(request.kms_key_id, "alias/rds-export");
            assert_eq!(request.bucket, "orders-exports");
            assert_eq!(request.prefix, "exports/");
            Ok(request.task_id.clone())
        });
        let service = mocks.into_service(&create_test_config(1));

        let (_, outcome) = service.start_snapshot_export("prod").await.unwrap();
        match outcome {
            QueryOutcome::Found { record, attempts } => {
                assert_eq!(attempts, 1);
                assert!(record.id.starts_with("exp-orders-db-"));
                assert_eq!(record.bucket, "orders-exports");
                assert_eq!(record.prefix, "exports/");
            }
            other => panic!("Expected Found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_export_failure_is_not_retried() {
        let mut mocks = Mocks::new();
        mocks
            .snapshots
            .expect_latest_snapshot()
            .times(1)
            .returning(|_, _| Ok(snapshot()));
        mocks.exporter.expect_start_export().times(1).returning(|_| {
            Err(BackupError::upstream(
                "StartExportTask",
                "ExportTaskAlreadyExists: task already exists",
            ))
        });
        let service = mocks.into_service(&create_test_config(3));

        let (_, outcome) = service.start_snapshot_export("prod").await.unwrap();
        assert_eq!(
            outcome,
            QueryOutcome::Failed {
                error: BackupError::upstream(
                    "StartExportTask",
                    "ExportTaskAlreadyExists: task already exists"
                ),
                attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn test_export_without_snapshot_is_not_found() {
        let mut mocks = Mocks::new();
        mocks
            .snapshots
            .expect_latest_snapshot()
            .times(2)
            .returning(|_, _| Ok(SnapshotRecord::default()));
        let service = mocks.into_service(&create_test_config(2));

        let (_, outcome) = service.start_snapshot_export("prod").await.unwrap();
        assert_eq!(outcome, QueryOutcome::NotFound { attempts: 2 });
    }

    #[tokio::test]
    async fn test_copy_requires_s3_configuration() {
        let mut config = create_test_config(1);
        config.aliyun.s3_export.bucket_name.clear();
        let service = Mocks::new().into_service(&config);

        let err = service.copy_backup_to_s3("prod").await.unwrap_err();
        assert!(matches!(err, BackupError::MissingConfig(_)));
        assert!(service.s3_export_config().is_err());
    }

    #[tokio::test]
    async fn test_copy_without_backup_is_not_found() {
        let mut mocks = Mocks::new();
        mocks
            .backups
            .expect_latest_backup()
            .times(1)
            .returning(|_| Ok(BackupRecord::default()));
        let service = mocks.into_service(&create_test_config(1));

        let outcome = service.copy_backup_to_s3("prod").await.unwrap();
        assert_eq!(outcome, QueryOutcome::NotFound { attempts: 1 });
    }

    #[tokio::test]
    async fn test_copy_download_failure_is_upload_error() {
        let base = serve(Router::new().route("/public.xb", get(|| async { StatusCode::FORBIDDEN }))).await;

        let mut mocks = Mocks::new();
        let url = format!("{base}/public.xb");
        mocks
            .backups
            .expect_latest_backup()
            .times(1)
            .returning(move |_| Ok(backup(&url, "")));
        let service = mocks.into_service(&create_test_config(1));

        let outcome = service.copy_backup_to_s3("prod").await.unwrap();
        assert_eq!(
            outcome,
            QueryOutcome::Failed {
                error: BackupError::upload("failed to download backup, status code: 403"),
                attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn test_copy_prefers_intranet_url_when_configured() {
        let base = serve(
            Router::new()
                .route("/public.xb", get(|| async { StatusCode::NOT_FOUND }))
                .route("/intranet.xb", get(|| async { "backup" })),
        )
        .await;

        let mut mocks = Mocks::new();
        let (public, intranet) = (format!("{base}/public.xb"), format!("{base}/intranet.xb"));
        mocks
            .backups
            .expect_latest_backup()
            .times(1)
            .returning(move |_| Ok(backup(&public, &intranet)));
        mocks
            .store
            .expect_put_object()
            .times(1)
            .returning(|bucket, key, body| {
                assert_eq!(bucket, "dr-backups");
                assert!(key.starts_with("prod/backup-prod-"));
                assert_eq!(&body[..], b"backup");
                Ok(format!("https://{bucket}.s3.ap-southeast-1.amazonaws.com/{key}"))
            });

        let mut config = create_test_config(1);
        config.upload.prefer_intranet_url = true;
        let service = mocks.into_service(&config);

        match service.copy_backup_to_s3("prod").await.unwrap() {
            QueryOutcome::Found { record, attempts } => {
                assert_eq!(attempts, 1);
                assert!(record.location.ends_with(&record.key));
            }
            other => panic!("Expected Found, got {:?}", other),
        }
    }
}
