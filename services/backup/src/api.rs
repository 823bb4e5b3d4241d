use crate::config::ApiConfig;
use crate::error::BackupError;
use crate::retry::QueryOutcome;
use crate::registry::Provider;
use crate::service::BackupService;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BackupService>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Serialize)]
pub struct InstancesResponse {
    pub aliyun: Vec<String>,
    pub aws: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct S3ConfigResponse {
    pub region: String,
    pub bucket_name: String,
}

/// Latest Alibaba Cloud backup
#[derive(Debug, Serialize)]
pub struct BackupResponse {
    pub backup_start_time: String,
    pub backup_download_url: String,
    pub backup_intranet_download_url: String,
    pub retries: u32,
}

/// Completed copy of an Alibaba Cloud backup into S3
#[derive(Debug, Serialize)]
pub struct BackupCopyResponse {
    pub message: String,
    pub s3_bucket: String,
    pub s3_key: String,
    pub location: String,
    pub region: String,
    pub retries: u32,
}

/// Latest available AWS snapshot
#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub snapshot_create_time: Option<DateTime<Utc>>,
    pub snapshot_arn: String,
    pub snapshot_id: String,
    pub status: String,
    pub instance_id: String,
    pub region: String,
    pub retries: u32,
}

/// Started AWS snapshot export
#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub export_task_id: String,
    pub snapshot_arn: String,
    pub instance_id: String,
    pub region: String,
    pub kms_key_id: String,
    pub s3_bucket_name: String,
    pub s3_prefix: String,
    pub retries: u32,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/instances", get(list_instances))
        .route("/alirds/s3config", get(get_s3_config))
        .route("/alirds/:env", get(get_aliyun_backup))
        .route("/alirds/export/s3/:env", post(copy_aliyun_backup_to_s3))
        .route("/awsrds/:env", get(get_aws_snapshot))
        .route("/awsrds/export/:env", post(start_aws_export))
        .layer(TraceLayer::new_for_http());

    let router = if config.cors_enabled {
        let cors = if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        };
        router.layer(cors)
    } else {
        router
    };

    router.with_state(state)
}

fn error_response(
    status: StatusCode,
    error: &str,
    details: Option<String>,
    retries: Option<u32>,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            details,
            retries,
        }),
    )
}

/// Errors raised before any vendor call
fn rejected(err: BackupError) -> ApiError {
    match err {
        BackupError::UnknownEnvironment { .. } => {
            warn!(error = %err, "Rejected request for unknown environment");
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid environment",
                Some(err.to_string()),
                None,
            )
        }
        BackupError::MissingConfig(_) => {
            warn!(error = %err, "Rejected request with incomplete configuration");
            error_response(
                StatusCode::BAD_REQUEST,
                "missing configuration",
                Some(err.to_string()),
                None,
            )
        }
        other => {
            error!(error = %other, "Unexpected error before query");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error",
                Some(other.to_string()),
                None,
            )
        }
    }
}

/// Map a non-found outcome to its error response; `failure` names the failed step
fn unsuccessful<T>(
    outcome: QueryOutcome<T>,
    not_found: &str,
    failure: impl FnOnce(&BackupError) -> &'static str,
) -> ApiError {
    match outcome {
        QueryOutcome::NotFound { attempts } => {
            error_response(StatusCode::NOT_FOUND, not_found, None, Some(attempts))
        }
        QueryOutcome::Failed { error, attempts } => {
            let message = failure(&error);
            error!(error = %error, retries = attempts, "{}", message);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                message,
                Some(error.to_string()),
                Some(attempts),
            )
        }
        QueryOutcome::Found { attempts, .. } => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error",
            None,
            Some(attempts),
        ),
    }
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy"
    }))
}

/// Configured environment names per provider
async fn list_instances(State(state): State<AppState>) -> Json<InstancesResponse> {
    let registry = state.service.registry();
    Json(InstancesResponse {
        aliyun: registry.environments(Provider::Aliyun),
        aws: registry.environments(Provider::Aws),
    })
}

/// Destination of Alibaba Cloud backup copies
async fn get_s3_config(
    State(state): State<AppState>,
) -> Result<Json<S3ConfigResponse>, ApiError> {
    let s3_config = state.service.s3_export_config().map_err(|e| {
        warn!(error = %e, "S3 configuration is missing");
        error_response(
            StatusCode::BAD_REQUEST,
            "S3 configuration is missing",
            Some(e.to_string()),
            None,
        )
    })?;

    Ok(Json(S3ConfigResponse {
        region: s3_config.region.clone(),
        bucket_name: s3_config.bucket_name.clone(),
    }))
}

/// Latest Alibaba Cloud backup download URLs
#[instrument(skip(state))]
async fn get_aliyun_backup(
    State(state): State<AppState>,
    Path(env): Path<String>,
) -> Result<Json<BackupResponse>, ApiError> {
    match state.service.latest_backup(&env).await.map_err(rejected)? {
        QueryOutcome::Found { record, attempts } => Ok(Json(BackupResponse {
            backup_start_time: record.start_time,
            backup_download_url: record.download_url,
            backup_intranet_download_url: record.intranet_download_url,
            retries: attempts,
        })),
        outcome => Err(unsuccessful(outcome, "no backups found", |_| {
            "failed to get backup URLs after retries"
        })),
    }
}

/// Copy the latest Alibaba Cloud backup into S3, responding once the upload completes
#[instrument(skip(state))]
async fn copy_aliyun_backup_to_s3(
    State(state): State<AppState>,
    Path(env): Path<String>,
) -> Result<Json<BackupCopyResponse>, ApiError> {
    let outcome = state
        .service
        .copy_backup_to_s3(&env)
        .await
        .map_err(|e| match e {
            BackupError::MissingConfig(_) => error_response(
                StatusCode::BAD_REQUEST,
                "S3 configuration is missing",
                Some(e.to_string()),
                None,
            ),
            other => rejected(other),
        })?;

    match outcome {
        QueryOutcome::Found { record, attempts } => {
            // Only reached with a complete S3 configuration
            let (bucket, region) = state
                .service
                .s3_export_config()
                .map(|c| (c.bucket_name.clone(), c.region.clone()))
                .unwrap_or_default();

            info!(key = %record.key, location = %record.location, "Backup copied to S3");
            Ok(Json(BackupCopyResponse {
                message: "Backup upload completed".to_string(),
                s3_bucket: bucket,
                s3_key: record.key,
                location: record.location,
                region,
                retries: attempts,
            }))
        }
        outcome => Err(unsuccessful(outcome, "no backup found", |error| match error {
            BackupError::Upload(_) => "failed to upload to S3",
            _ => "failed to get backup URLs after retries",
        })),
    }
}

/// Latest available AWS RDS snapshot
#[instrument(skip(state))]
async fn get_aws_snapshot(
    State(state): State<AppState>,
    Path(env): Path<String>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let (instance, outcome) = state.service.latest_snapshot(&env).await.map_err(rejected)?;

    match outcome {
        QueryOutcome::Found { record, attempts } => Ok(Json(SnapshotResponse {
            snapshot_create_time: record.create_time,
            snapshot_arn: record.arn,
            snapshot_id: record.id,
            status: record.status,
            instance_id: instance.id.clone(),
            region: instance.region.clone(),
            retries: attempts,
        })),
        outcome => Err(unsuccessful(outcome, "no snapshots found", |_| {
            "failed to get snapshot info"
        })),
    }
}

/// Start an S3 export of the latest available AWS RDS snapshot
#[instrument(skip(state))]
async fn start_aws_export(
    State(state): State<AppState>,
    Path(env): Path<String>,
) -> Result<Json<ExportResponse>, ApiError> {
    let (instance, outcome) = state
        .service
        .start_snapshot_export(&env)
        .await
        .map_err(rejected)?;

    match outcome {
        QueryOutcome::Found { record, attempts } => Ok(Json(ExportResponse {
            export_task_id: record.id,
            snapshot_arn: record.source_arn,
            instance_id: instance.id.clone(),
            region: instance.region.clone(),
            kms_key_id: instance.kms_key_id.clone(),
            s3_bucket_name: record.bucket,
            s3_prefix: record.prefix,
            retries: attempts,
        })),
        outcome => Err(unsuccessful(outcome, "no snapshots found", |error| match error {
            BackupError::Upstream {
                operation: "StartExportTask",
                ..
            } => "failed to start export task",
            _ => "failed to get snapshot info",
        })),
    }
}

/// Start the backup API server; returns once `shutdown` resolves and open requests finish
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting backup API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
