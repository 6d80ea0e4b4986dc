pub mod config;
pub mod errors;
pub mod memory_cache;
pub mod notification;
pub mod watch_manager;

pub use config::WatchConfig;
pub use memory_cache::{CacheStats, MemoryCache};
pub use notification::{notification_channel, CacheNotification, CacheNotificationOpt};
pub use watch_manager::{StopHandle, Watch};
