use anyhow::{Context, Result};
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use backup_service::{
    start_api_server, AliyunCredentials, AliyunRdsClient, AppState, AwsRdsClient, BackupService,
    Config, InstanceRegistry, S3ObjectUploader, StreamingUploader,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "backup-service")]
#[command(about = "Serves RDS backup lookups, snapshot exports and backup copies to S3.")]
struct Cli {
    /// Configuration file; replaces the default search locations
    #[arg(long, env = "BACKUP_CONFIG")]
    config: Option<PathBuf>,

    /// API listen port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.api.port = port;
    }
    if let Some(log_level) = cli.log_level {
        config.service.log_level = log_level;
    }

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        aliyun_instances = config.aliyun.instances.len(),
        aws_instances = config.aws.instances.len(),
        "Starting RDS backup service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Vendor API calls get an overall deadline, downloads only connect/read timeouts
    let api_http = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .read_timeout(config.read_timeout())
        .timeout(config.request_timeout())
        .build()
        .context("Failed to build API HTTP client")?;
    let download_http = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .read_timeout(config.read_timeout())
        .build()
        .context("Failed to build download HTTP client")?;

    let credentials = config
        .aliyun_credentials()
        .map(|(access_key_id, access_key_secret)| AliyunCredentials {
            access_key_id,
            access_key_secret,
        });
    let aliyun = Arc::new(AliyunRdsClient::new(
        api_http,
        config.aliyun.endpoint.clone(),
        credentials,
    ));

    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .timeout_config(
            TimeoutConfig::builder()
                .connect_timeout(config.connect_timeout())
                .read_timeout(config.read_timeout())
                .build(),
        )
        .load()
        .await;

    let registry = InstanceRegistry::from_config(&config);
    let aws = Arc::new(AwsRdsClient::new(
        &sdk_config,
        &registry.aws_regions(),
        config.aws.snapshot_page_size,
        config.request_timeout(),
    ));

    let store = Arc::new(S3ObjectUploader::new(&sdk_config, &config.aliyun.s3_export));
    let uploader = Arc::new(StreamingUploader::new(
        download_http,
        store,
        config.upload.part_size_bytes,
        config.upload.concurrency,
    ));

    let service = Arc::new(BackupService::new(
        &config,
        aliyun,
        aws.clone(),
        aws,
        uploader,
    ));

    // Serve until a shutdown signal arrives
    let api_state = AppState { service };
    if let Err(e) = start_api_server(api_state, &config.api, shutdown_signal()).await {
        error!(error = %e, "API server error");
        return Err(e);
    }

    info!("RDS backup service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Shutting down RDS backup service");
}
