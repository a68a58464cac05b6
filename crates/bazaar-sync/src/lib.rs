//! Live state synchronisation for the marketplace client: shared change
//! channels, coalesced view refreshes, schedule cleanup, notification
//! freshness and thumbnail memoization.

pub mod backend;
pub mod channels;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod flight;
pub mod markers;
pub mod memory;
pub mod notifications;
pub mod sweeper;
pub mod thumbnails;
pub mod timers;

pub use backend::{Backend, ChangeFeed, Filter, SortOrder};
pub use channels::{ChannelManager, ChannelState, SubscriptionHandle};
pub use config::{ReconnectPolicy, SyncConfig, ThumbnailConfig};
pub use context::SyncContext;
pub use dispatcher::{CachedView, Trigger, ViewDispatcher, ViewHandle, ViewKey, ViewSubscription};
pub use error::{Result, SyncError};
pub use markers::MarkerStore;
pub use memory::MemoryBackend;
pub use notifications::{Freshness, NotificationTracker};
pub use sweeper::{ScheduleSweeper, SweepReport};
pub use thumbnails::{FfmpegGenerator, ThumbnailCache, ThumbnailGenerator};
pub use timers::TimerRegistry;
