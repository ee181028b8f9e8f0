use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// A background loop that runs `tick` on a fixed period until shut down.
///
/// The cancellation signal is checked between ticks; a tick in progress is
/// allowed to finish. Dropping the handle without calling [`PeriodicTask::shutdown`]
/// also stops the loop, but nothing waits for it.
pub struct PeriodicTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawns the loop on the current tokio runtime. The first tick runs one
    /// full `period` after spawning.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = watch::channel(false);
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() completes its first tick immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    biased;
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => tick().await,
                }
            }
            debug!(task = name, "Periodic task stopped");
        });
        debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");
        Self {
            name,
            shutdown: tx,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the loop to stop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(task = self.name, error = %e, "Periodic task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ticks_until_shutdown() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let task = PeriodicTask::spawn("test", Duration::from_secs(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        task.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_stops_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let task = PeriodicTask::spawn("dropped", Duration::from_secs(1), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        drop(task);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
