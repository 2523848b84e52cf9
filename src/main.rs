use anyhow::Context;
use axum::Router;
use chunkport::api;
use chunkport::client::{EngineOptions, HttpTransport, ProgressCallback, UploadEngine, UploadFile};
use chunkport::config::{
    normalize_base_url, ChunkBackend, ChunkBackendKind, Limits, ServerConfig, CHUNK_SESSION_TTL_SECS,
    CHUNK_SIZE_BYTES, MAX_UPLOAD_BYTES, SWEEP_INTERVAL_SECS, TEMP_RETENTION_SECS,
};
use chunkport::session::UploadService;
use chunkport::store::ChunkStore;
use chunkport::temp_area::TempArea;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "chunkport")]
#[command(about = "Resumable chunked attachment uploads", version)]
struct Cli {
    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true, env = "CHUNKPORT_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the upload server
    Serve(ServeArgs),
    /// Upload one file to a running server
    Upload(UploadArgs),
    /// Run one sweep of stale chunk sessions and expired temp files
    Sweep(StorageArgs),
}

#[derive(Args, Debug)]
struct StorageArgs {
    /// Data directory for chunks and temp attachments
    #[arg(short, long, default_value = "./data", env = "CHUNKPORT_DATA_DIR")]
    data_dir: PathBuf,

    /// Chunk store backend
    #[arg(long, value_enum, default_value = "local", env = "CHUNKPORT_CHUNK_BACKEND")]
    chunk_backend: ChunkBackendKind,

    /// Bucket for the s3 backend
    #[arg(long, env = "CHUNKPORT_S3_BUCKET")]
    s3_bucket: Option<String>,

    #[arg(long, env = "CHUNKPORT_S3_REGION")]
    s3_region: Option<String>,

    /// Custom endpoint for S3-compatible services
    #[arg(long, env = "CHUNKPORT_S3_ENDPOINT")]
    s3_endpoint: Option<String>,

    /// Maximum file size in bytes
    #[arg(long, default_value_t = MAX_UPLOAD_BYTES, env = "CHUNKPORT_MAX_UPLOAD_BYTES")]
    max_upload_bytes: u64,

    /// Chunk size in bytes
    #[arg(long, default_value_t = CHUNK_SIZE_BYTES, env = "CHUNKPORT_CHUNK_SIZE")]
    chunk_size: u64,

    /// Chunk sessions older than this many seconds are swept
    #[arg(long, default_value_t = CHUNK_SESSION_TTL_SECS, env = "CHUNKPORT_SESSION_TTL")]
    session_ttl: u64,

    /// Temp attachments older than this many seconds are swept
    #[arg(long, default_value_t = TEMP_RETENTION_SECS, env = "CHUNKPORT_TEMP_RETENTION")]
    temp_retention: u64,

    /// Prefix for URLs returned to clients
    #[arg(long, default_value = "", env = "CHUNKPORT_PUBLIC_BASE_URL")]
    public_base_url: String,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Server port
    #[arg(short, long, default_value = "8080", env = "CHUNKPORT_PORT")]
    port: u16,

    /// Seconds between background sweeps
    #[arg(long, default_value_t = SWEEP_INTERVAL_SECS, env = "CHUNKPORT_SWEEP_INTERVAL")]
    sweep_interval: u64,

    #[command(flatten)]
    storage: StorageArgs,
}

#[derive(Args, Debug)]
struct UploadArgs {
    /// File to upload
    file: PathBuf,

    /// Server base URL
    #[arg(short, long, default_value = "http://localhost:8080", env = "CHUNKPORT_SERVER")]
    server: String,

    /// Grouping key for the temp attachment area
    #[arg(short, long)]
    temp_identifier: String,

    /// Continue an existing upload session
    #[arg(long)]
    resume: Option<String>,

    /// Give up if the whole upload takes longer than this many seconds
    #[arg(long)]
    deadline: Option<u64>,

    /// Chunk size the server was started with
    #[arg(long, default_value_t = CHUNK_SIZE_BYTES)]
    chunk_size: u64,

    #[arg(long, default_value_t = MAX_UPLOAD_BYTES)]
    max_upload_bytes: u64,
}

impl StorageArgs {
    fn server_config(&self, sweep_interval: u64) -> anyhow::Result<ServerConfig> {
        let mut config = ServerConfig::with_data_dir(&self.data_dir, &self.public_base_url)?;
        config.limits = Limits::new(self.max_upload_bytes, self.chunk_size)?;
        config.chunk_backend = ChunkBackend::from_args(
            &self.chunk_backend,
            &self.data_dir,
            self.s3_bucket.as_deref(),
            self.s3_region.as_deref(),
            self.s3_endpoint.as_deref(),
        )?;
        config.session_ttl = Duration::from_secs(self.session_ttl);
        config.temp_retention = Duration::from_secs(self.temp_retention);
        config.sweep_interval = Duration::from_secs(sweep_interval.max(1));
        Ok(config)
    }
}

fn build_service(config: &ServerConfig) -> anyhow::Result<UploadService> {
    let chunks = ChunkStore::from_backend(&config.chunk_backend).context("opening chunk store")?;
    let temp = TempArea::new(&config.temp_dir)
        .with_context(|| format!("creating temp area at {:?}", config.temp_dir))?;
    Ok(UploadService::new(chunks, temp, config.limits, config.public_base_url.clone()))
}

fn init_logging(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_filter(filter());

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chunkport.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(console).with(file).init();
    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.storage.server_config(args.sweep_interval)?;

    info!("🚀 chunkport upload server");
    info!("📁 Data directory: {:?}", args.storage.data_dir);
    info!("📦 Chunk backend: {:?}", config.chunk_backend);
    info!(
        "📏 Limits: max {} bytes, chunks of {} bytes",
        config.limits.max_upload_bytes(), config.limits.chunk_size()
    );
    info!(
        "🧹 Sweeping every {}s (sessions > {}s, temp files > {}s)",
        config.sweep_interval.as_secs(),
        config.session_ttl.as_secs(),
        config.temp_retention.as_secs()
    );

    let service = build_service(&config)?;
    service.start_periodic_sweeps(config.sweep_interval, config.session_ttl, config.temp_retention);

    let app = Router::new()
        .merge(api::routes(service))
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("🌐 Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn upload(args: UploadArgs) -> anyhow::Result<()> {
    let base_url = normalize_base_url(&args.server)?;
    let transport = Arc::new(HttpTransport::new(&base_url)?);
    let options = EngineOptions {
        limits: Limits::new(args.max_upload_bytes, args.chunk_size)?,
        deadline: args.deadline.map(Duration::from_secs),
        ..EngineOptions::default()
    };
    let engine = UploadEngine::new(transport, options);

    let file = UploadFile::from_path(&args.file)
        .await
        .with_context(|| format!("reading {:?}", args.file))?;
    info!("⬆️  Uploading {} ({} bytes) to {}", file.name, file.source.len(), base_url);

    let task = engine.add(file, &args.temp_identifier)?;
    let on_progress: ProgressCallback = Arc::new(|percent| info!("   {}%", percent));
    let done = match &args.resume {
        Some(upload_id) => engine.resume(task, upload_id, on_progress).await?,
        None => engine.upload(task, on_progress).await?,
    };

    info!("✅ Uploaded {} -> {}", done.original_filename, done.path);
    println!("{}", serde_json::to_string_pretty(&done)?);
    Ok(())
}

async fn sweep(args: StorageArgs) -> anyhow::Result<()> {
    let config = args.server_config(SWEEP_INTERVAL_SECS)?;
    let service = build_service(&config)?;

    let sessions = service.sweep_stale_sessions(config.session_ttl).await?;
    let files = service.sweep_temp_area(config.temp_retention).await?;
    info!("🧹 Removed {} chunk sessions and {} temp files", sessions, files);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_dir.as_ref());

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Upload(args) => upload(args).await,
        Command::Sweep(args) => sweep(args).await,
    }
}
