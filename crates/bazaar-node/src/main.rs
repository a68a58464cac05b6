use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use bazaar_db::Database;
use bazaar_sync::{Backend, Filter, MemoryBackend, SyncConfig, SyncContext, ViewHandle, markers};
use bazaar_types::{CollectionSpec, NotificationRecord};

/// Column of a product row holding the listing video.
const VIDEO_COLUMN: &str = "video_url";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bazaar_syncd=debug,bazaar_sync=debug,bazaar_db=info".into()),
        )
        .init();

    // Config
    let config = SyncConfig::from_env()?;
    let db_path = std::env::var("BAZAAR_DB_PATH").unwrap_or_else(|_| "bazaar-sync.db".into());
    let owner = std::env::var("BAZAAR_OWNER").unwrap_or_else(|_| "local".into());

    let backend = match std::env::var("BAZAAR_SEED_PATH") {
        Ok(path) => {
            let raw = tokio::fs::read_to_string(&path).await?;
            let seed: serde_json::Value = serde_json::from_str(&raw)?;
            MemoryBackend::from_seed(&seed)?
        }
        Err(_) => MemoryBackend::new(),
    };

    // Init database
    let db = Arc::new(Database::open(&PathBuf::from(&db_path))?);
    let acknowledged = markers::acknowledged_ids(&db)?;
    info!("{} notifications already acknowledged", acknowledged.len());
    let ctx = SyncContext::new(config, Arc::new(backend), db);

    let mut mounted = Vec::new();
    for spec in [
        CollectionSpec::products(),
        CollectionSpec::seller_products(),
        CollectionSpec::profile(),
        CollectionSpec::favorites(),
        CollectionSpec::balances(),
        CollectionSpec::orders(),
    ] {
        let view = ctx.views.mount(&owner, &spec);
        tokio::spawn(log_snapshots(view.handle().clone()));
        mounted.push(view);
    }

    let products = ctx.views.handle(&owner, &CollectionSpec::products());
    tokio::spawn(prefetch_thumbnails(ctx.clone(), products));

    let schedules = ctx.views.mount(&owner, &CollectionSpec::schedules());
    let sweeping = ctx.schedules.watch(schedules.handle().clone());
    tokio::spawn(log_snapshots(schedules.handle().clone()));
    mounted.push(schedules);

    track_notifications(&ctx).await;

    info!("Bazaar sync node running for {}", owner);
    shutdown_signal().await;

    sweeping.abort();
    for view in mounted {
        ctx.views.unmount(view);
    }
    ctx.shutdown().await;

    Ok(())
}

async fn log_snapshots(mut handle: ViewHandle) {
    while let Some(view) = handle.changed().await {
        let key = handle.key();
        match &view.last_error {
            Some(e) => warn!("{} for {}: {}", key.collection, key.owner, e),
            None if view.is_loading => {}
            None => info!(
                "{} for {}: {} rows (v{})",
                key.collection,
                key.owner,
                view.data.len(),
                view.version
            ),
        }
    }
}

/// Warm the thumbnail cache for every product video as listings load.
async fn prefetch_thumbnails(ctx: SyncContext, mut products: ViewHandle) {
    while let Some(view) = products.changed().await {
        if view.is_loading {
            continue;
        }
        for record in view.data.iter() {
            let Some(source) = record.get(VIDEO_COLUMN).and_then(|v| v.as_str()) else {
                continue;
            };
            if ctx.thumbnails.peek(source).is_some() {
                continue;
            }
            let thumbnails = ctx.thumbnails.clone();
            let source = source.to_string();
            tokio::spawn(async move {
                if let Ok(locator) = thumbnails.get_or_generate(&source).await {
                    info!("Thumbnail for {} at {}", source, locator);
                }
            });
        }
    }
}

async fn track_notifications(ctx: &SyncContext) {
    let rows = match ctx.backend.query("notifications", &Filter::default()).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!("Loading notifications failed: {}", e);
            return;
        }
    };

    let records: Vec<NotificationRecord> = rows
        .into_iter()
        .filter_map(|row| serde_json::from_value(row).ok())
        .collect();
    let fresh = ctx.notifications.track_all(&records, Utc::now()).await;
    info!("Tracking {} notifications ({} new)", records.len(), fresh);
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
