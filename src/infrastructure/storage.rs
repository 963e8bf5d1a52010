use crate::config::AppConfig;
use crate::services::storage::LocalStorageService;
use std::sync::Arc;
use tracing::info;

pub async fn setup_storage(config: &AppConfig) -> anyhow::Result<Arc<LocalStorageService>> {
    info!(
        "🗄️  Media storage: {} (served at {})",
        config.media_root.display(),
        config.media_url
    );

    if tokio::fs::metadata(&config.media_root).await.is_err() {
        info!("📁 Media root not found, creating...");
        tokio::fs::create_dir_all(&config.media_root).await?;
    }

    Ok(Arc::new(LocalStorageService::new(
        config.media_root.clone(),
        config.media_url.clone(),
    )))
}
