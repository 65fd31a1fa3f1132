use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Limiters whose per-identity state can be swept.
pub trait IdleEviction: Send + Sync {
    /// Remove identities idle longer than twice the window. Returns how many were removed.
    fn evict_idle(&self) -> usize;

    /// Suggested sweep period.
    fn eviction_interval(&self) -> Duration;
}

/// Background sweep of idle identities, tied to one limiter.
///
/// The task holds only a `Weak` reference: it ends on its own once the limiter is dropped.
/// [`shutdown`](Self::shutdown) stops it and waits for it; dropping the handle stops it without
/// waiting. The sweep only removes entries, it never touches live counters.
#[derive(Debug)]
pub struct CleanupTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CleanupTask {
    /// Sweep `limiter` every `interval`. Must be called inside a tokio runtime.
    pub fn spawn<L>(limiter: &Arc<L>, interval: Duration) -> Self
    where
        L: IdleEviction + ?Sized + 'static,
    {
        let weak: Weak<L> = Arc::downgrade(limiter);
        let token = CancellationToken::new();
        let stop = token.clone();
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing can be idle yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(limiter) = weak.upgrade() else { break };
                        let evicted = limiter.evict_idle();
                        if evicted > 0 {
                            tracing::debug!(evicted, "evicted idle rate limit entries");
                        }
                    }
                }
            }
            tracing::trace!("rate limit cleanup stopped");
        });

        Self { token, handle: Some(handle) }
    }

    /// Sweep at the limiter's own suggested interval (one window).
    pub fn spawn_default<L>(limiter: &Arc<L>) -> Self
    where
        L: IdleEviction + ?Sized + 'static,
    {
        let interval = limiter.eviction_interval();
        Self::spawn(limiter, interval)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stop the sweep and wait until the task has exited.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "rate limit cleanup task failed");
            }
        }
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
