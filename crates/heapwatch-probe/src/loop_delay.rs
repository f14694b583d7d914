//! Scheduler latency sampler
//!
//! Measures how late timer wakeups fire relative to their deadline. On a
//! healthy executor the overshoot stays near zero; a saturated worker
//! pool or long synchronous sections show up as growing overshoot, the
//! cooperative-runtime analogue of event-loop delay.

use heapwatch_common::MetricRing;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default number of retained delay observations.
pub const DEFAULT_DELAY_SAMPLES: usize = 50;

/// Background sampler measuring timer-wakeup overshoot.
pub struct LoopDelayMonitor {
    latest_us: Arc<AtomicU64>,
    history: Arc<Mutex<MetricRing<f64>>>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LoopDelayMonitor {
    /// Start sampling with the given probe resolution.
    pub fn start(resolution: Duration) -> Self {
        let latest_us = Arc::new(AtomicU64::new(0));
        let history = Arc::new(Mutex::new(MetricRing::new(DEFAULT_DELAY_SAMPLES)));
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let latest = latest_us.clone();
        let ring = history.clone();
        let handle = tokio::spawn(async move {
            loop {
                let before = Instant::now();
                tokio::select! {
                    _ = tokio::time::sleep(resolution) => {}
                    _ = shutdown_rx.changed() => break,
                }
                let overshoot = before.elapsed().saturating_sub(resolution);
                let micros = overshoot.as_micros() as u64;
                latest.store(micros, Ordering::Relaxed);
                ring.lock().push(micros as f64 / 1_000.0);
            }
            debug!("loop delay monitor stopped");
        });

        Self {
            latest_us,
            history,
            shutdown,
            handle,
        }
    }

    /// Most recent overshoot in milliseconds.
    pub fn current_delay_ms(&self) -> f64 {
        self.latest_us.load(Ordering::Relaxed) as f64 / 1_000.0
    }

    /// Retained overshoot history, oldest first.
    pub fn history(&self) -> Vec<f64> {
        self.history.lock().to_vec()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for LoopDelayMonitor {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.handle.abort();
    }
}
