use clap::Parser;
use kubemirror::k8s::cache::config::WATCH_TIMEOUT_SECONDS;
use kubemirror::k8s::cache::{notification_channel, MemoryCache, Watch};
use kubemirror::k8s::client;
use kubemirror::k8s::cluster::KubeClusterClient;
use kubemirror::k8s::object::CacheKey;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace to mirror
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// User agent sent to the API server
    #[arg(long)]
    user_agent: Option<String>,

    /// Seconds the API server keeps each watch open before it is reopened
    #[arg(long, default_value_t = WATCH_TIMEOUT_SECONDS)]
    watch_timeout: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = Args::parse();
    let client = client::new(args.user_agent.as_deref()).await?;
    let cluster = Arc::new(KubeClusterClient::new(client).with_watch_timeout(args.watch_timeout));

    let done = CancellationToken::new();
    let (notifications, mut notify_rx) = notification_channel(done.clone());
    let cache = Arc::new(MemoryCache::with_notifications(notifications));

    let watch = Watch::new(args.namespace, cluster, cache.clone());
    let stop = watch.start().await?;
    info!("👀 Mirroring namespace {}, Ctrl-C to stop", watch.namespace());
    let key = CacheKey::namespace(watch.namespace());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notified = notify_rx.recv() => {
                if notified.is_none() {
                    break;
                }
                let objects = cache.retrieve(&key)?;
                info!("📦 {} objects mirrored in namespace {}", objects.len(), key.namespace);
            }
        }
    }

    // unblock pending notifications before waiting on the handlers
    done.cancel();
    stop.stop().await;
    Ok(())
}
