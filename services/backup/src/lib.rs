//! RDS Backup Service
//!
//! Cross-cloud backup service for Alibaba Cloud RDS and AWS RDS instances.
//! Logical environment names ("prod", "staging") are mapped to concrete
//! instances by configuration; the HTTP API looks up the latest backup or
//! snapshot of an environment, starts AWS snapshot exports, and copies
//! Alibaba Cloud backup artifacts into S3.
//!
//! ## Features
//!
//! - **Bounded Retry**: Backup queries are retried a fixed number of times,
//!   telling "not found yet" apart from failed calls
//! - **Snapshot Exports**: Start an RDS export task for the latest available
//!   automated snapshot
//! - **Streaming Copy**: Backup artifacts stream from the download URL into an
//!   S3 multipart upload, never fully held in memory
//!
//! ## Architecture
//!
//! ```text
//!                     HTTP API
//!                  ┌──────────────┐
//!                  │ Backup       │
//!                  │ Service      │
//!                  └──────────────┘
//!                    │    │     │
//!        ┌───────────┘    │     └────────────┐
//!        ▼                ▼                  ▼
//! ┌──────────────┐ ┌──────────────┐   ┌──────────────┐
//! │ Instance     │ │ Retry        │   │ Streaming    │
//! │ Registry     │ │ Policy       │   │ Uploader     │
//! └──────────────┘ └──────────────┘   └──────────────┘
//!                    │         │        │         │
//!                    ▼         ▼        ▼         ▼
//!             ┌──────────┐ ┌──────────┐ ┌────────┐ ┌────────┐
//!             │ Aliyun   │ │ AWS RDS  │ │ Backup │ │ S3     │
//!             │ RDS API  │ │ API      │ │ URL    │ │ Bucket │
//!             └──────────┘ └──────────┘ └────────┘ └────────┘
//! ```

pub mod aliyun;
pub mod api;
pub mod aws_rds;
pub mod config;
pub mod error;
pub mod export;
pub mod models;
pub mod registry;
pub mod retry;
pub mod service;
pub mod uploader;

pub use aliyun::{AliyunCredentials, AliyunRdsClient, BackupQuerier};
pub use api::{start_api_server, AppState};
pub use aws_rds::{AwsRdsClient, SnapshotQuerier};
pub use config::Config;
pub use error::BackupError;
pub use export::{ExportRequest, SnapshotExporter};
pub use models::{BackupRecord, ExportTask, SnapshotRecord, UploadResult};
pub use registry::{InstanceRegistry, Provider};
pub use retry::{QueryOutcome, RetryPolicy};
pub use service::BackupService;
pub use uploader::{ObjectUploader, S3ObjectUploader, StreamingUploader};
