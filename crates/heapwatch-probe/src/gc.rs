//! GC notification seam
//!
//! Rust itself has no collector; hosts embedding a managed runtime (or an
//! arena/pool layer with collection-like phases) report collection events
//! through a [`GcRecorder`]. The probe drains whatever arrived since the
//! previous sample into the next [`heapwatch_common::Sample`]. With no
//! recorder wired up the GC portion of a sample is simply empty.

use heapwatch_common::{Error, GcEvent, GcKind, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Host-side handle used to report collection events. Cheap to clone.
#[derive(Clone)]
pub struct GcRecorder {
    tx: mpsc::UnboundedSender<GcEvent>,
}

impl GcRecorder {
    /// Report one collection. Dropped silently after the probe shuts down.
    pub fn record(&self, kind: GcKind, duration_ms: f64, flags: u32) {
        let _ = self.tx.send(GcEvent {
            kind,
            duration_ms,
            flags,
        });
    }
}

/// Probe-side receiver; events accumulate here between samples.
pub struct GcEventDrain {
    rx: Mutex<mpsc::UnboundedReceiver<GcEvent>>,
}

impl GcEventDrain {
    /// Take every event reported since the last drain, in arrival order.
    pub fn drain(&self) -> Vec<GcEvent> {
        let mut rx = self.rx.lock();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        if !events.is_empty() {
            debug!(count = events.len(), "drained gc events");
        }
        events
    }
}

/// Create a connected recorder/drain pair.
pub fn gc_channel() -> (GcRecorder, GcEventDrain) {
    let (tx, rx) = mpsc::unbounded_channel();
    (GcRecorder { tx }, GcEventDrain { rx: Mutex::new(rx) })
}

/// Hook for runtimes that can trigger a collection on demand.
///
/// `force_gc` on the agent delegates here; without an installed hook the
/// call reports itself as unsupported.
#[async_trait::async_trait]
pub trait GcHooks: Send + Sync {
    async fn force_collect(&self) -> Result<()>;
}

/// Default hook for hosts without a collector.
pub struct NoGcRuntime;

#[async_trait::async_trait]
impl GcHooks for NoGcRuntime {
    async fn force_collect(&self) -> Result<()> {
        Err(Error::Monitoring(
            "runtime does not expose a collection trigger".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_events_in_arrival_order() {
        let (recorder, drain) = gc_channel();
        recorder.record(GcKind::Scavenge, 1.5, 0);
        recorder.record(GcKind::MarkSweepCompact, 12.0, 1);

        let events = drain.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, GcKind::Scavenge);
        assert_eq!(events[1].kind, GcKind::MarkSweepCompact);

        // Subsequent drain is empty until new events arrive.
        assert!(drain.drain().is_empty());
        recorder.record(GcKind::All, 3.0, 0);
        assert_eq!(drain.drain().len(), 1);
    }

    #[tokio::test]
    async fn default_hook_reports_unsupported() {
        let hook = NoGcRuntime;
        assert!(hook.force_collect().await.is_err());
    }
}
