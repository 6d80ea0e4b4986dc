use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Signal that the cache contents changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheNotification;

/// Where a [`MemoryCache`](super::MemoryCache) reports its mutations
///
/// Every successful mutation sends one [`CacheNotification`] on `sender` and
/// waits until the consumer has taken it off the channel or `done` is
/// cancelled. Once `done` is cancelled no delivery blocks again, which is what
/// lets the watch coordinator shut down while nobody drains the channel.
#[derive(Debug, Clone)]
pub struct CacheNotificationOpt {
    sender: mpsc::Sender<CacheNotification>,
    done: CancellationToken,
}

impl CacheNotificationOpt {
    #[must_use]
    pub const fn new(sender: mpsc::Sender<CacheNotification>, done: CancellationToken) -> Self {
        Self { sender, done }
    }

    /// Deliver one notification and wait for the consumer to take it
    ///
    /// Returns `false` if `done` fired first or the consumer went away.
    pub(crate) async fn deliver(&self) -> bool {
        tokio::select! {
            biased;
            () = self.done.cancelled() => {
                trace!("Notification skipped, consumer is done");
                false
            }
            taken = self.handoff() => taken,
        }
    }

    async fn handoff(&self) -> bool {
        if self.sender.send(CacheNotification).await.is_err() {
            return false;
        }
        // The single slot frees up only once the receiver has taken what we sent
        self.sender.reserve().await.is_ok()
    }
}

/// Single-slot notification channel
///
/// Senders hand off through [`CacheNotificationOpt`], which turns the slot
/// into a rendezvous point.
#[must_use]
pub fn notification_channel(
    done: CancellationToken,
) -> (CacheNotificationOpt, mpsc::Receiver<CacheNotification>) {
    let (tx, rx) = mpsc::channel(1);
    (CacheNotificationOpt::new(tx, done), rx)
}
