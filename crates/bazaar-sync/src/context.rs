//! Wires the sync services together from one configuration.

use std::sync::Arc;

use tracing::info;

use bazaar_types::CollectionSpec;

use crate::backend::Backend;
use crate::channels::ChannelManager;
use crate::config::SyncConfig;
use crate::dispatcher::ViewDispatcher;
use crate::markers::MarkerStore;
use crate::notifications::NotificationTracker;
use crate::sweeper::ScheduleSweeper;
use crate::thumbnails::{FfmpegGenerator, ThumbnailCache, ThumbnailGenerator};

#[derive(Clone)]
pub struct SyncContext {
    pub config: SyncConfig,
    pub backend: Arc<dyn Backend>,
    pub channels: ChannelManager,
    pub views: ViewDispatcher,
    pub schedules: ScheduleSweeper,
    pub notifications: NotificationTracker,
    pub thumbnails: ThumbnailCache,
}

impl SyncContext {
    /// Thumbnails are generated with the configured `ffmpeg`.
    pub fn new(config: SyncConfig, backend: Arc<dyn Backend>, markers: Arc<dyn MarkerStore>) -> Self {
        let generator = Arc::new(FfmpegGenerator::new(&config.thumbnails));
        Self::with_generator(config, backend, markers, generator)
    }

    pub fn with_generator(
        config: SyncConfig,
        backend: Arc<dyn Backend>,
        markers: Arc<dyn MarkerStore>,
        generator: Arc<dyn ThumbnailGenerator>,
    ) -> Self {
        let channels = ChannelManager::new(backend.clone(), config.reconnect);
        let views = ViewDispatcher::new(backend.clone(), channels.clone(), config.freshness_window);
        let schedules = ScheduleSweeper::new(
            backend.clone(),
            CollectionSpec::schedules().table,
            config.sweep_lookahead,
        );
        let notifications = NotificationTracker::new(markers, config.notification_window);
        let thumbnails = ThumbnailCache::new(generator);

        Self {
            config,
            backend,
            channels,
            views,
            schedules,
            notifications,
            thumbnails,
        }
    }

    /// Close every change channel, cancel notification timers and wait for
    /// outstanding schedule deletions.
    pub async fn shutdown(&self) {
        self.channels.shutdown();
        let timers = self.notifications.teardown();
        self.schedules.drain().await;
        info!("Sync context shut down ({} notification timers cancelled)", timers);
    }
}
