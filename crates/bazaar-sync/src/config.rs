//! Runtime configuration.
//!
//! Defaults match the behaviour of the mobile client; every knob can be
//! overridden through a `BAZAAR_*` environment variable.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Capped exponential backoff for change-feed reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts before a channel is given up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThumbnailConfig {
    pub output_dir: PathBuf,
    pub ffmpeg: PathBuf,
    /// Offset into the video at which the still is taken.
    pub seek: Duration,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./thumbnails"),
            ffmpeg: PathBuf::from("ffmpeg"),
            seek: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// A view fetched less than this long ago is fresh; focus does not refetch it.
    pub freshness_window: Duration,
    /// How long a notification stays "new" after it fires.
    pub notification_window: chrono::Duration,
    /// Entries starting within this long are eligible for pre-emptive cleanup.
    pub sweep_lookahead: chrono::Duration,
    pub reconnect: ReconnectPolicy,
    pub thumbnails: ThumbnailConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(5 * 60),
            notification_window: chrono::Duration::hours(24),
            sweep_lookahead: chrono::Duration::hours(24),
            reconnect: ReconnectPolicy::default(),
            thumbnails: ThumbnailConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>("BAZAAR_FRESHNESS_SECS")? {
            config.freshness_window = Duration::from_secs(secs);
        }
        if let Some(hours) = env_parse::<i64>("BAZAAR_NOTIFICATION_WINDOW_HOURS")? {
            config.notification_window = chrono::Duration::hours(hours);
        }
        if let Some(hours) = env_parse::<i64>("BAZAAR_SWEEP_LOOKAHEAD_HOURS")? {
            config.sweep_lookahead = chrono::Duration::hours(hours);
        }
        if let Some(ms) = env_parse::<u64>("BAZAAR_RECONNECT_INITIAL_MS")? {
            config.reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("BAZAAR_RECONNECT_MAX_MS")? {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_parse::<u32>("BAZAAR_RECONNECT_MAX_ATTEMPTS")? {
            config.reconnect.max_attempts = (attempts > 0).then_some(attempts);
        }
        if let Ok(dir) = std::env::var("BAZAAR_THUMBNAIL_DIR") {
            config.thumbnails.output_dir = dir.into();
        }
        if let Ok(bin) = std::env::var("BAZAAR_FFMPEG") {
            config.thumbnails.ffmpeg = bin.into();
        }
        if let Some(ms) = env_parse::<u64>("BAZAAR_THUMBNAIL_SEEK_MS")? {
            config.thumbnails.seek = Duration::from_millis(ms);
        }

        if config.reconnect.initial_delay > config.reconnect.max_delay {
            return Err(SyncError::Config(
                "BAZAAR_RECONNECT_INITIAL_MS must not exceed BAZAAR_RECONNECT_MAX_MS".into(),
            ));
        }

        Ok(config)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{} has invalid value {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}
