//! Self-re-arming periodic task

use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A periodic task that re-arms itself even when the callback fails.
///
/// Callback errors and panics are logged and the schedule continues;
/// nothing is ever silently dropped. The task stops when [`SafeTimer::stop`]
/// is called or the timer is dropped.
pub struct SafeTimer {
    name: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SafeTimer {
    /// Spawn a periodic task running `callback` every `period`.
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut callback: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the cadence
            // starts one period after spawn.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let run = AssertUnwindSafe(callback()).catch_unwind().await;
                        match run {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!(timer = %task_name, error = %e, "timer callback failed");
                            }
                            Err(_) => {
                                error!(timer = %task_name, "timer callback panicked");
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!(timer = %task_name, "timer stopping");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the task to stop after the current callback completes.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for SafeTimer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.handle.abort();
    }
}
