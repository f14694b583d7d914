//! Adaptive sampling optimization
//!
//! Owns two of the agent's steering decisions: how often the sampler
//! runs (interval within `[min, max]`) and what fraction of optional
//! work it performs (sampling rate selected by strategy). Both react to
//! system load and memory pressure computed from the latest sample.

use heapwatch_common::{AgentEvent, Sample};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Interval growth factor under load.
const BACKOFF_FACTOR: f64 = 1.5;
/// Interval shrink factor when idle.
const SPEEDUP_FACTOR: f64 = 0.8;
/// Rate changes below this are not worth announcing.
const RATE_EMIT_DELTA: f64 = 0.05;

/// Sampling-rate selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    /// Always the base rate.
    Fixed,
    /// Multiplicative nudges from load and pressure.
    Adaptive,
    /// Weighted score over load, pressure, and measured overhead.
    Intelligent,
}

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub base_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub load_threshold: f64,
    pub pressure_threshold: f64,
    pub strategy: SamplingStrategy,
    pub base_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(30),
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(300),
            load_threshold: 0.7,
            pressure_threshold: 0.8,
            strategy: SamplingStrategy::Adaptive,
            base_rate: 1.0,
            min_rate: 0.1,
            max_rate: 1.0,
        }
    }
}

/// Load and pressure extracted from one sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSnapshot {
    /// Process CPU seconds over uptime, normalized by core count.
    pub system_load: f64,
    /// RSS over total system memory.
    pub memory_pressure: f64,
}

impl ResourceSnapshot {
    pub fn from_sample(sample: &Sample) -> Self {
        let uptime = sample.os.uptime_secs.max(1) as f64;
        let cpus = sample.os.cpus.max(1) as f64;
        let cpu_secs = (sample.cpu.user_ms + sample.cpu.system_ms) / 1_000.0;
        let system_load = (cpu_secs / uptime / cpus).clamp(0.0, 1.0);

        let memory_pressure = if sample.os.total_mem > 0 {
            (sample.heap.physical as f64 / sample.os.total_mem as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };

        Self {
            system_load,
            memory_pressure,
        }
    }
}

/// Result of one overhead measurement pass.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct OverheadReport {
    pub iterations: u32,
    pub total_us: u64,
    pub mean_us: f64,
}

/// The performance optimizer.
pub struct PerformanceOptimizer {
    config: OptimizerConfig,
    current_interval: Mutex<Duration>,
    current_rate: Mutex<f64>,
    /// `[0, 1]`; updated by overhead measurements, consumed by the
    /// intelligent strategy.
    overhead_efficiency: Mutex<f64>,
    events: broadcast::Sender<AgentEvent>,
}

impl PerformanceOptimizer {
    pub fn new(config: OptimizerConfig, events: broadcast::Sender<AgentEvent>) -> Self {
        let base_rate = config.base_rate.clamp(config.min_rate, config.max_rate);
        Self {
            current_interval: Mutex::new(config.base_interval),
            current_rate: Mutex::new(base_rate),
            overhead_efficiency: Mutex::new(0.9),
            config,
            events,
        }
    }

    pub fn current_interval(&self) -> Duration {
        *self.current_interval.lock()
    }

    pub fn current_rate(&self) -> f64 {
        *self.current_rate.lock()
    }

    /// One optimization tick: adjust both interval and rate from the
    /// snapshot. Scheduled every 10 seconds by the supervisor.
    pub fn optimize(&self, snapshot: ResourceSnapshot) {
        self.optimize_interval(snapshot);
        self.optimize_rate(snapshot);
    }

    /// Back off under load, speed up when idle, inside `[min, max]`.
    pub fn optimize_interval(&self, snapshot: ResourceSnapshot) -> Duration {
        let mut interval = self.current_interval.lock();
        let previous = *interval;

        let overloaded = snapshot.system_load > self.config.load_threshold
            || snapshot.memory_pressure > self.config.pressure_threshold;
        let idle = snapshot.system_load < 0.3 && snapshot.memory_pressure < 0.5;

        let next = if overloaded {
            let scaled = previous.as_millis() as f64 * BACKOFF_FACTOR;
            Duration::from_millis(scaled as u64).min(self.config.max_interval)
        } else if idle {
            let scaled = previous.as_millis() as f64 * SPEEDUP_FACTOR;
            Duration::from_millis(scaled as u64).max(self.config.min_interval)
        } else {
            previous
        };

        if next != previous {
            *interval = next;
            drop(interval);
            info!(
                previous_ms = previous.as_millis() as u64,
                current_ms = next.as_millis() as u64,
                "sampling interval optimized"
            );
            let _ = self.events.send(AgentEvent::IntervalOptimized {
                previous_ms: previous.as_millis() as u64,
                current_ms: next.as_millis() as u64,
            });
        }
        next
    }

    /// Recompute the sampling rate per the configured strategy.
    pub fn optimize_rate(&self, snapshot: ResourceSnapshot) -> f64 {
        let mut rate = self.current_rate.lock();
        let previous = *rate;

        let next = match self.config.strategy {
            SamplingStrategy::Fixed => self.config.base_rate,
            SamplingStrategy::Adaptive => {
                let mut next = previous;
                if snapshot.system_load > 0.7 || snapshot.memory_pressure > 0.8 {
                    next *= 0.7;
                } else if snapshot.system_load < 0.3 && snapshot.memory_pressure < 0.4 {
                    next *= 1.2;
                }
                next
            }
            SamplingStrategy::Intelligent => {
                let efficiency = *self.overhead_efficiency.lock();
                let score = 0.4 * (1.0 - snapshot.system_load)
                    + 0.4 * (1.0 - snapshot.memory_pressure)
                    + 0.2 * efficiency;
                self.config.min_rate + score * (self.config.max_rate - self.config.min_rate)
            }
        };
        let next = next.clamp(self.config.min_rate, self.config.max_rate);

        if (next - previous).abs() >= RATE_EMIT_DELTA {
            *rate = next;
            drop(rate);
            debug!(previous, current = next, "sampling rate optimized");
            let _ = self.events.send(AgentEvent::SamplingOptimized {
                previous,
                current: next,
            });
        } else {
            *rate = next;
        }
        next
    }

    /// Time `iterations` runs of `work` and refresh the overhead
    /// efficiency estimate.
    pub fn measure_overhead<F: FnMut()>(&self, iterations: u32, mut work: F) -> OverheadReport {
        let iterations = iterations.max(1);
        let started = Instant::now();
        for _ in 0..iterations {
            work();
        }
        let total = started.elapsed();
        let mean_us = total.as_micros() as f64 / iterations as f64;

        // A collection pass costing ~1ms of a 1s budget scores ~0.999;
        // the estimate saturates toward zero past 100ms per pass.
        let efficiency = (1.0 - mean_us / 100_000.0).clamp(0.0, 1.0);
        *self.overhead_efficiency.lock() = efficiency;

        OverheadReport {
            iterations,
            total_us: total.as_micros() as u64,
            mean_us,
        }
    }

    pub fn overhead_efficiency(&self) -> f64 {
        *self.overhead_efficiency.lock()
    }

    pub fn reset(&self) {
        *self.current_interval.lock() = self.config.base_interval;
        *self.current_rate.lock() = self
            .config
            .base_rate
            .clamp(self.config.min_rate, self.config.max_rate);
    }
}
