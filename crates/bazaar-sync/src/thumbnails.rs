//! Thumbnail memoization.
//!
//! Maps a video locator to the locator of a still frame taken from it. Each
//! source is generated at most once per process while it succeeds; callers
//! arriving while a generation runs join it. Failures are never cached.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ThumbnailConfig;
use crate::error::{Result, SyncError};
use crate::flight::{Flight, is_settled, spawn_flight};

#[async_trait]
pub trait ThumbnailGenerator: Send + Sync + 'static {
    /// Produce a thumbnail for `source` and return where it can be loaded from.
    async fn generate(&self, source: &str) -> Result<String>;
}

/// Extracts one frame with an external `ffmpeg` binary.
pub struct FfmpegGenerator {
    ffmpeg: PathBuf,
    output_dir: PathBuf,
    seek: Duration,
}

impl FfmpegGenerator {
    pub fn new(config: &ThumbnailConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            output_dir: config.output_dir.clone(),
            seek: config.seek,
        }
    }

    /// Output path for `source`; stable across restarts.
    pub fn output_path(&self, source: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(source.as_bytes()));
        self.output_dir.join(format!("{}.jpg", digest))
    }
}

#[async_trait]
impl ThumbnailGenerator for FfmpegGenerator {
    async fn generate(&self, source: &str) -> Result<String> {
        let failed = |reason: String| SyncError::Generation {
            source_locator: source.to_string(),
            reason,
        };

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| failed(format!("creating {}: {}", self.output_dir.display(), e)))?;

        let output = self.output_path(source);
        let seek = format!("{:.3}", self.seek.as_secs_f64());
        debug!("Extracting frame at {}s from {}", seek, source);

        let result = Command::new(&self.ffmpeg)
            .arg("-ss")
            .arg(&seek)
            .arg("-i")
            .arg(source)
            .args(["-frames:v", "1", "-y"])
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| failed(format!("spawning {}: {}", self.ffmpeg.display(), e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let last_line = stderr.lines().last().unwrap_or_default().trim().to_string();
            return Err(failed(format!("{} ({})", result.status, last_line)));
        }

        Ok(output.to_string_lossy().into_owned())
    }
}

enum Slot {
    Ready(String),
    Pending { seq: u64, flight: Flight<String> },
}

#[derive(Clone)]
pub struct ThumbnailCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    generator: Arc<dyn ThumbnailGenerator>,
    slots: Mutex<HashMap<String, Slot>>,
    next_seq: AtomicU64,
}

impl CacheInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ThumbnailCache {
    pub fn new(generator: Arc<dyn ThumbnailGenerator>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                generator,
                slots: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Cached locator for `source`, generating it if needed.
    pub async fn get_or_generate(&self, source: &str) -> Result<String> {
        let (seq, flight) = {
            let mut slots = self.inner.slots();
            // A finished flight nobody has promoted yet still counts.
            if let Some(locator) = settled_locator(slots.get(source)) {
                slots.insert(source.to_string(), Slot::Ready(locator.clone()));
                return Ok(locator);
            }
            match slots.get(source) {
                Some(Slot::Ready(locator)) => return Ok(locator.clone()),
                Some(Slot::Pending { seq, flight }) if !is_settled(flight) => {
                    debug!("Joining thumbnail generation for {}", source);
                    (*seq, flight.clone())
                }
                _ => {
                    let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
                    let generator = self.inner.generator.clone();
                    let owned = source.to_string();
                    let flight = spawn_flight(async move { generator.generate(&owned).await });
                    slots.insert(
                        source.to_string(),
                        Slot::Pending {
                            seq,
                            flight: flight.clone(),
                        },
                    );
                    (seq, flight)
                }
            }
        };

        let result = flight.await.map_err(|e| match e {
            SyncError::Generation { .. } => e,
            other => SyncError::Generation {
                source_locator: source.to_string(),
                reason: other.to_string(),
            },
        });

        let mut slots = self.inner.slots();
        let ours = matches!(slots.get(source), Some(Slot::Pending { seq: s, .. }) if *s == seq);
        match &result {
            Ok(locator) => {
                if ours {
                    info!("Thumbnail ready for {}", source);
                    slots.insert(source.to_string(), Slot::Ready(locator.clone()));
                }
            }
            Err(e) => {
                if ours {
                    warn!("{}", e);
                    slots.remove(source);
                }
            }
        }
        result
    }

    /// Cached locator without generating.
    pub fn peek(&self, source: &str) -> Option<String> {
        match self.inner.slots().get(source) {
            Some(Slot::Ready(locator)) => Some(locator.clone()),
            _ => None,
        }
    }

    /// Number of completed entries.
    pub fn len(&self) -> usize {
        self.inner
            .slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn settled_locator(slot: Option<&Slot>) -> Option<String> {
    match slot {
        Some(Slot::Pending { flight, .. }) => match flight.peek() {
            Some(Ok(locator)) => Some(locator.clone()),
            _ => None,
        },
        _ => None,
    }
}
