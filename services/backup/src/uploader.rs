//! Streaming copy of backup artifacts from an HTTP source into S3.
//!
//! The source body is cut into fixed-size parts as it arrives. Parts are
//! uploaded in parallel, bounded by a semaphore, so at most `concurrency + 1`
//! parts are held in memory. A body smaller than one part is written with a
//! single `PutObject`.
//!
//! A multipart upload that fails, or whose future is dropped mid-flight, is
//! aborted so that no billed parts are left behind.

use crate::config::S3ExportConfig;
use crate::error::BackupError;
use crate::models::{backup_object_key, UploadResult};
use async_trait::async_trait;
use aws_types::SdkConfig;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// S3 rejects multipart uploads with more parts than this
const MAX_PARTS: i32 = 10_000;

/// A part accepted by the object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: String,
}

/// Object store primitives used by the streaming uploader
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectUploader: Send + Sync {
    /// Single-request upload; returns the object location
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<String, BackupError>;

    /// Returns the upload id
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, BackupError>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, BackupError>;

    /// `parts` must be ordered by part number; returns the object location
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<String, BackupError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), BackupError>;
}

/// [`ObjectUploader`] backed by the AWS S3 SDK
pub struct S3ObjectUploader {
    client: S3Client,
    region: String,
    endpoint_url: Option<String>,
    force_path_style: bool,
}

impl S3ObjectUploader {
    /// Create an S3 client for the export destination
    pub fn new(sdk_config: &SdkConfig, config: &S3ExportConfig) -> Self {
        let mut s3_config_builder = S3ConfigBuilder::from(sdk_config)
            .region(aws_config::Region::new(config.region.clone()));

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket_name,
            region = %config.region,
            "S3 uploader initialized"
        );

        Self::from_client(client, config)
    }

    /// Wrap an existing client; `config` supplies the addressing used for object URLs
    pub fn from_client(client: S3Client, config: &S3ExportConfig) -> Self {
        Self {
            client,
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            force_path_style: config.force_path_style,
        }
    }

    fn object_location(&self, bucket: &str, key: &str) -> String {
        object_url(
            self.endpoint_url.as_deref(),
            self.force_path_style,
            &self.region,
            bucket,
            key,
        )
    }
}

/// Location of an object written without a multipart completion response
fn object_url(
    endpoint_url: Option<&str>,
    force_path_style: bool,
    region: &str,
    bucket: &str,
    key: &str,
) -> String {
    match (endpoint_url, force_path_style) {
        (Some(endpoint), true) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, key),
        (Some(endpoint), false) => format!("{}/{}", endpoint.trim_end_matches('/'), key),
        (None, true) => format!("https://s3.{region}.amazonaws.com/{bucket}/{key}"),
        (None, false) => format!("https://{bucket}.s3.{region}.amazonaws.com/{key}"),
    }
}

fn s3_error<E>(operation: &'static str, err: E) -> BackupError
where
    E: std::error::Error + Send + Sync + 'static,
{
    BackupError::upstream(operation, DisplayErrorContext(err).to_string())
}

#[async_trait]
impl ObjectUploader for S3ObjectUploader {
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<String, BackupError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| s3_error("PutObject", e))?;

        Ok(self.object_location(bucket, key))
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, BackupError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_error("CreateMultipartUpload", e))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| BackupError::upstream("CreateMultipartUpload", "no upload ID in response"))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, BackupError> {
        let response = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| s3_error("UploadPart", e))?;

        Ok(UploadedPart {
            part_number,
            e_tag: response.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<String, BackupError> {
        let completed_parts = parts
            .into_iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(part.e_tag)
                    .build()
            })
            .collect::<Vec<_>>();

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| s3_error("CompleteMultipartUpload", e))?;

        Ok(response
            .location()
            .map(str::to_string)
            .unwrap_or_else(|| self.object_location(bucket, key)))
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), BackupError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| s3_error("AbortMultipartUpload", e))?;

        Ok(())
    }
}

/// Downloads backup artifacts and streams them into an [`ObjectUploader`]
pub struct StreamingUploader {
    http: reqwest::Client,
    store: Arc<dyn ObjectUploader>,
    part_size: usize,
    concurrency: usize,
}

impl StreamingUploader {
    /// `http` should carry connect and read timeouts but no overall deadline,
    /// since a download may run for hours.
    pub fn new(
        http: reqwest::Client,
        store: Arc<dyn ObjectUploader>,
        part_size: u64,
        concurrency: usize,
    ) -> Self {
        Self {
            http,
            store,
            part_size: usize::try_from(part_size).unwrap_or(usize::MAX).max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Copy the artifact at `source_url` to
    /// `{environment}/backup-{environment}-{yyyyMMdd-HHmmss}.xb` in `bucket`.
    ///
    /// A non-success download status fails before the object store is touched.
    #[instrument(skip(self, source_url), fields(bucket = %bucket, environment = %environment))]
    pub async fn upload_from_url(
        &self,
        source_url: &str,
        bucket: &str,
        environment: &str,
    ) -> Result<UploadResult, BackupError> {
        info!("Starting backup download");
        let body = self.download(source_url).await?;

        let key = backup_object_key(environment, Utc::now());
        info!(key = %key, "Starting upload to S3");

        let location = self.upload_stream(bucket, &key, body).await.map_err(|e| {
            error!(error = %e, key = %key, "Failed to upload to S3");
            e
        })?;

        info!(key = %key, location = %location, "Upload completed successfully");
        Ok(UploadResult { key, location })
    }

    async fn download(
        &self,
        source_url: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, BackupError>>, BackupError> {
        let response = self.http.get(source_url).send().await.map_err(|e| {
            error!(error = %e, "Failed to download backup");
            BackupError::upload(format!("failed to download backup: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            error!(status_code = status.as_u16(), "Non-OK HTTP status while downloading");
            return Err(BackupError::upload(format!(
                "failed to download backup, status code: {}",
                status.as_u16()
            )));
        }

        Ok(response
            .bytes_stream()
            .map_err(|e| BackupError::upload(format!("failed to read backup body: {e}")))
            .boxed())
    }

    /// Stream `body` into `bucket/key` and return the object location
    pub async fn upload_stream(
        &self,
        bucket: &str,
        key: &str,
        body: BoxStream<'static, Result<Bytes, BackupError>>,
    ) -> Result<String, BackupError> {
        let mut reader = PartReader::new(body, self.part_size);

        let first = reader.next_part().await?.unwrap_or_default();
        if first.len() < self.part_size {
            debug!(size_bytes = first.len(), "Body fits in one part, using PutObject");
            let size = first.len() as u64;
            let location = self.store.put_object(bucket, key, first).await?;
            metrics::counter!("backup.upload.bytes").increment(size);
            return Ok(location);
        }

        let upload_id = self.store.create_multipart_upload(bucket, key).await?;
        let guard = AbortGuard::new(self.store.clone(), bucket, key, &upload_id);

        let parts = match self.upload_parts(bucket, key, &upload_id, first, &mut reader).await {
            Ok(parts) => parts,
            Err(e) => {
                guard.abort().await;
                return Err(e);
            }
        };

        match self
            .store
            .complete_multipart_upload(bucket, key, &upload_id, parts)
            .await
        {
            Ok(location) => {
                guard.disarm();
                Ok(location)
            }
            Err(e) => {
                guard.abort().await;
                Err(e)
            }
        }
    }

    /// Upload every part of the body, returning them ordered by part number.
    ///
    /// Returning early drops the `JoinSet`, which cancels parts still in flight.
    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        first: Bytes,
        reader: &mut PartReader,
    ) -> Result<Vec<UploadedPart>, BackupError> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<Result<UploadedPart, BackupError>> = JoinSet::new();
        let mut completed = Vec::new();
        let mut part_number: i32 = 1;
        let mut next = Some(first);

        while let Some(body) = next {
            if part_number > MAX_PARTS {
                return Err(BackupError::upload(format!(
                    "backup exceeds {} parts of {} bytes",
                    MAX_PARTS, self.part_size
                )));
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| BackupError::upload(e.to_string()))?;

            // Surface failures of finished parts before reading more of the body
            while let Some(result) = tasks.try_join_next() {
                completed.push(join_result(result)?);
            }

            let size = body.len();
            let store = self.store.clone();
            let (bucket, key, upload_id) = (bucket.to_string(), key.to_string(), upload_id.to_string());
            tasks.spawn(async move {
                let _permit = permit;
                let part = store
                    .upload_part(&bucket, &key, &upload_id, part_number, body)
                    .await?;
                debug!(part_number, size_bytes = size, "Part uploaded");
                metrics::counter!("backup.upload.parts").increment(1);
                metrics::counter!("backup.upload.bytes").increment(size as u64);
                Ok(part)
            });

            part_number += 1;
            next = reader.next_part().await?;
        }

        while let Some(result) = tasks.join_next().await {
            completed.push(join_result(result)?);
        }

        completed.sort_by_key(|part| part.part_number);
        Ok(completed)
    }
}

fn join_result(
    result: Result<Result<UploadedPart, BackupError>, tokio::task::JoinError>,
) -> Result<UploadedPart, BackupError> {
    result.map_err(|e| BackupError::upload(format!("part upload task failed: {e}")))?
}

/// Cuts a byte stream into parts of exactly `part_size` bytes; the last may be shorter
struct PartReader {
    body: BoxStream<'static, Result<Bytes, BackupError>>,
    buffer: BytesMut,
    part_size: usize,
    finished: bool,
}

impl PartReader {
    fn new(body: BoxStream<'static, Result<Bytes, BackupError>>, part_size: usize) -> Self {
        Self {
            body,
            buffer: BytesMut::new(),
            part_size,
            finished: false,
        }
    }

    /// `None` once the body is exhausted and no bytes remain
    async fn next_part(&mut self) -> Result<Option<Bytes>, BackupError> {
        while !self.finished && self.buffer.len() < self.part_size {
            match self.body.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.finished = true,
            }
        }

        if self.buffer.is_empty() {
            return Ok(None);
        }
        let len = self.buffer.len().min(self.part_size);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }
}

/// Aborts a multipart upload unless disarmed.
///
/// Dropping an armed guard, for example when the request future is
/// cancelled, schedules the abort on the runtime.
struct AbortGuard {
    target: Option<AbortTarget>,
}

struct AbortTarget {
    store: Arc<dyn ObjectUploader>,
    bucket: String,
    key: String,
    upload_id: String,
}

impl AbortTarget {
    async fn abort(self) {
        match self
            .store
            .abort_multipart_upload(&self.bucket, &self.key, &self.upload_id)
            .await
        {
            Ok(()) => warn!(key = %self.key, upload_id = %self.upload_id, "Multipart upload aborted"),
            Err(e) => error!(
                error = %e,
                key = %self.key,
                upload_id = %self.upload_id,
                "Failed to abort multipart upload"
            ),
        }
    }
}

impl AbortGuard {
    fn new(store: Arc<dyn ObjectUploader>, bucket: &str, key: &str, upload_id: &str) -> Self {
        Self {
            target: Some(AbortTarget {
                store,
                bucket: bucket.to_string(),
                key: key.to_string(),
                upload_id: upload_id.to_string(),
            }),
        }
    }

    fn disarm(mut self) {
        self.target = None;
    }

    async fn abort(mut self) {
        if let Some(target) = self.target.take() {
            target.abort().await;
        }
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(target.abort());
                }
                Err(_) => error!(
                    key = %target.key,
                    upload_id = %target.upload_id,
                    "No runtime available to abort multipart upload"
                ),
            }
        }
    }
}
