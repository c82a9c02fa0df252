//! Periodic ping sender with missed-pong accounting.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Heartbeat configuration.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatOptions {
    /// Ping cadence; zero disables the heartbeat entirely.
    pub ping_interval: Duration,
    /// Consecutive unanswered pings tolerated before the timeout fires.
    pub max_missed_pongs: u32,
    /// Answer inbound pings with pongs automatically.
    pub auto_pong: bool,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            max_missed_pongs: 3,
            auto_pong: true,
        }
    }
}

/// Handle to one running heartbeat task.
///
/// Every tick increments the missed-pong counter; once it exceeds the
/// maximum, the timeout callback runs exactly once and the task stops.
/// Otherwise a ping is sent. [`Heartbeat::pong_received`] resets the
/// counter.
pub struct Heartbeat {
    missed: Arc<AtomicU32>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    /// Start the timer task.
    ///
    /// `ping` is called on every healthy tick; `on_timeout` once the
    /// counter exceeds `max_missed_pongs`. The owner is expected to close
    /// the connection from the timeout callback.
    pub fn start<P, PFut, T, TFut>(
        interval: Duration,
        max_missed_pongs: u32,
        ping: P,
        on_timeout: T,
    ) -> Self
    where
        P: Fn() -> PFut + Send + 'static,
        PFut: Future<Output = ()> + Send + 'static,
        T: FnOnce() -> TFut + Send + 'static,
        TFut: Future<Output = ()> + Send + 'static,
    {
        let missed = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let missed = missed.clone();
            let cancel = cancel.clone();
            async move {
                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick of a tokio interval completes at once.
                timer.tick().await;

                let mut on_timeout = Some(on_timeout);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        _ = timer.tick() => {}
                    }
                    let count = missed.fetch_add(1, Ordering::AcqRel) + 1;
                    if count > max_missed_pongs {
                        (on_timeout.take().expect("timeout fires once"))().await;
                        return;
                    }
                    ping().await;
                }
            }
        });

        Self {
            missed,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Reset the missed-pong counter.
    pub fn pong_received(&self) {
        self.missed.store(0, Ordering::Release);
    }

    /// Current missed-pong count.
    #[must_use]
    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::Acquire)
    }

    /// Cancel the timer and join its task.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("missed", &self.missed())
            .finish_non_exhaustive()
    }
}
