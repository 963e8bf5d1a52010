use clap::Parser;
use dotenvy::dotenv;
use flattop::config::AppConfig;
use flattop::infrastructure::database;
use flattop::services::reconciler::{KeepStrategy, ReconcileError, Reconciler};
use flattop::services::storage::LocalStorageService;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Find duplicate files under MEDIA_ROOT/card_images/ and optionally delete
/// them, rewiring card images to the kept file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Actually delete duplicate files and update DB rows. Without this flag
    /// the command performs a dry run.
    #[arg(long)]
    confirm: bool,

    /// Which file to keep among duplicates
    #[arg(long, value_enum, default_value_t = KeepStrategy::Oldest)]
    keep: KeepStrategy,

    /// Override MEDIA_ROOT
    #[arg(long)]
    media_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenv().ok();
    let args = Args::parse();

    // stdout carries the report, logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flattop=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = AppConfig::from_env();
    if let Some(root) = args.media_root {
        config.media_root = root;
    }

    info!("🔌 Connecting to database...");
    let db = database::setup_database(&config).await?;
    let storage = Arc::new(LocalStorageService::new(
        config.media_root.clone(),
        config.media_url.clone(),
    ));

    let reconciler = Reconciler::new(db, storage, config);

    match reconciler.reconcile(args.keep, args.confirm).await {
        Ok(report) => {
            print!("{}", report);
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ ReconcileError::MediaDirMissing(_)) => {
            println!("{}", e);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}
