use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transcode_worker::config::env::{self, EnvKey};
use transcode_worker::config::settings::AppConfig;
use transcode_worker::infrastructure::db::pool::{connect_to_db, run_migrations};
use transcode_worker::modules::jobs::{JobStore, PgJobStore};
use transcode_worker::modules::media::repository::MediaRepository;
use transcode_worker::workers::{PoolConfig, TranscodePipeline, WorkerPool};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(version, about = "Transcodes uploaded videos from the shared job queue")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker pool until interrupted (default).
    Run,
    /// Register an uploaded file and queue it for transcoding.
    Enqueue {
        /// File name relative to the uploads directory.
        filename: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Print one job as JSON.
    Status { job_id: Uuid },
    /// Print job counts per status as JSON.
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    init_tracing();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let default_level = if env::get_flag(EnvKey::VerboseLogging, false) {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::new().context("DATABASE_URL must be set")?;

    let db = connect_to_db(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&db).await.context("Failed to run migrations")?;

    let store = Arc::new(PgJobStore::new(db.clone()));

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_pool(&config, store).await,
        Command::Enqueue {
            filename,
            title,
            priority,
        } => {
            let source = config.paths.source_path(&filename);
            if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
                bail!("Source file {} does not exist", source.display());
            }

            let title = title.unwrap_or_else(|| filename.clone());
            let (media, job) = store.enqueue_upload(&filename, &title, priority).await?;
            info!(job_id = %job.id, media_id = %media.id, "Job enqueued");
            println!("{}", job.id);
            store.close().await;
            Ok(())
        }
        Command::Status { job_id } => {
            let job = store
                .get_job(job_id)
                .await?
                .with_context(|| format!("Job {job_id} not found"))?;
            let media = MediaRepository::find_by_id(&db, job.media_id).await?;
            let out = serde_json::json!({ "job": job, "media": media });
            println!("{}", serde_json::to_string_pretty(&out)?);
            store.close().await;
            Ok(())
        }
        Command::Stats => {
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            store.close().await;
            Ok(())
        }
    }
}

async fn run_pool(config: &AppConfig, store: Arc<PgJobStore>) -> Result<()> {
    let pipeline = TranscodePipeline::new(config.encode.clone());
    let pool = WorkerPool::start(PoolConfig::from(config), store, pipeline).await?;

    match pool.stats().await {
        Ok(stats) => info!(
            pending = stats.pending,
            processing = stats.processing,
            "Queue state at startup"
        ),
        Err(e) => bail!("Job store unreachable: {e}"),
    }
    if config.delete_source_on_success {
        warn!("Source files will be deleted after successful encodes");
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, finishing in-flight jobs");
        trigger.cancel();
    });

    pool.run(shutdown).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
