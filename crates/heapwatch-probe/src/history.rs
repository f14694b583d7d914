//! Retained sample history

use heapwatch_common::{GcEvent, MetricRing, Sample};

pub const DEFAULT_HEAP_SAMPLES: usize = 60;
pub const DEFAULT_GC_EVENTS: usize = 100;
pub const DEFAULT_LOOP_SAMPLES: usize = 50;

/// Bounded history of recent observations, the source for baselines and
/// trend analysis. Owned and mutated by the sampler task only.
pub struct SampleHistory {
    samples: MetricRing<Sample>,
    gc: MetricRing<GcEvent>,
    loop_delays: MetricRing<f64>,
}

impl SampleHistory {
    pub fn new(heap_capacity: usize, gc_capacity: usize, loop_capacity: usize) -> Self {
        Self {
            samples: MetricRing::new(heap_capacity),
            gc: MetricRing::new(gc_capacity),
            loop_delays: MetricRing::new(loop_capacity),
        }
    }

    pub fn push(&mut self, sample: &Sample) {
        for event in &sample.gc {
            self.gc.push(event.clone());
        }
        self.loop_delays.push(sample.event_loop_delay_ms);
        self.samples.push(sample.clone());
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples.to_vec()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.last()
    }

    /// Heap usage of the most recent `n` samples, oldest first.
    pub fn recent_heap_used(&self, n: usize) -> Vec<f64> {
        self.samples.tail(n).map(|s| s.heap.used as f64).collect()
    }

    pub fn gc_events(&self) -> Vec<GcEvent> {
        self.gc.to_vec()
    }

    pub fn loop_delays(&self) -> Vec<f64> {
        self.loop_delays.to_vec()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.gc.clear();
        self.loop_delays.clear();
    }
}

impl Default for SampleHistory {
    fn default() -> Self {
        Self::new(
            DEFAULT_HEAP_SAMPLES,
            DEFAULT_GC_EVENTS,
            DEFAULT_LOOP_SAMPLES,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use heapwatch_common::{CpuStats, GcKind, HeapStats, OsStats};

    fn sample(used: u64, gc_count: usize) -> Sample {
        Sample {
            timestamp: Utc::now(),
            heap: HeapStats {
                used,
                total: used,
                limit: used * 4,
                ..Default::default()
            },
            gc: (0..gc_count)
                .map(|_| GcEvent {
                    kind: GcKind::Scavenge,
                    duration_ms: 1.0,
                    flags: 0,
                })
                .collect(),
            event_loop_delay_ms: 0.5,
            cpu: CpuStats::default(),
            os: OsStats::default(),
        }
    }

    #[test]
    fn history_is_bounded_and_ordered() {
        let mut history = SampleHistory::new(3, 5, 3);
        for i in 0..6u64 {
            history.push(&sample(i * 100, 1));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.recent_heap_used(10), vec![300.0, 400.0, 500.0]);
        assert_eq!(history.gc_events().len(), 5);
    }
}
