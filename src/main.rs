use anyhow::{Context, Result};
use s3_copy_proxy::{
    AppConfig, ProxyState,
    config::TargetKind,
    services::{
        disk_gateway::DiskGateway,
        gateway::StorageGateway,
        host::HostType,
        http_source::HttpSource,
        metrics::LogMetricsSink,
        s3_gateway::S3Gateway,
    },
};
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting s3-copy-proxy with config: {:?}", cfg);

    // --- Target storage ---
    let target: Arc<dyn StorageGateway> = match cfg.target {
        TargetKind::S3 => Arc::new(
            S3Gateway::from_env(cfg.bucket.clone(), cfg.region.clone(), cfg.endpoint_url.clone())
                .await,
        ),
        TargetKind::Disk => {
            let disk = open_disk_target(&cfg).await?;
            let applied = disk.migrate().await?;
            if migrate {
                tracing::info!("Database migration complete ({} statements).", applied);
                return Ok(()); // exit after migration
            }
            Arc::new(disk)
        }
    };
    if migrate {
        anyhow::bail!("--migrate only applies to the disk target");
    }

    // --- Source storage ---
    let source: Arc<dyn StorageGateway> =
        Arc::new(HttpSource::new(cfg.source.clone()).context("building source http client")?);

    // --- Host identity ---
    let host_type = HostType::from_metadata_url(cfg.metadata_url.as_deref());
    let host = host_type
        .details()
        .await
        .context("discovering host details")?;
    tracing::info!("Host Type: {}", host_type.description());
    tracing::info!(
        "hostname={} region={} instance-id={} instance-type={}",
        host.hostname,
        host.region,
        host.instance_id,
        host.instance_type
    );

    // --- Initialize core service ---
    let metrics = Arc::new(LogMetricsSink::new(
        host,
        cfg.source.to_string(),
        cfg.bucket.clone(),
    ));
    tracing::info!(
        "Replicating {} into {} (prefix `{}`)",
        source.describe(),
        target.describe(),
        cfg.prefix
    );
    let state = ProxyState::new(cfg.proxy_config(), source, target, metrics);

    // --- Build router ---
    let app = s3_copy_proxy::app(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Proxy server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shut down gracefully");
    Ok(())
}

/// Open the SQLite metadata pool and payload directory for the disk target.
async fn open_disk_target(cfg: &AppConfig) -> Result<DiskGateway> {
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx will not create the file on its own without `mode=rwc`.
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(db_path)
        .with_context(|| format!("opening metadata database {}", db_path))?;

    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;

    Ok(DiskGateway::new(Arc::new(db), cfg.storage_dir.clone()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down gracefully...");
}
