pub mod error;
pub mod k8s;

pub use error::{Error, Result};
pub use k8s::cache::{
    notification_channel, CacheNotification, CacheNotificationOpt, MemoryCache, StopHandle, Watch,
};
pub use k8s::cluster::{ClusterClient, FakeClusterClient, KubeClusterClient};
pub use k8s::object::{CacheKey, Identity, Object};
