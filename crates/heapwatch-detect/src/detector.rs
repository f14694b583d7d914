//! Statistical leak detection
//!
//! The detector runs in two phases. During the baseline phase every
//! incoming sample feeds a buffer; once the configured duration elapses
//! or enough samples arrive, the baseline is promoted exactly once.
//! Afterwards each sample is classified against five pattern detectors
//! whose firings accumulate into a leak probability.

use crate::regression::{linear_regression, mean, std_dev};
use chrono::{DateTime, Utc};
use heapwatch_common::config::AgentConfig;
use heapwatch_common::{
    Baseline, LeakVerdict, MetricRing, Sample, Sensitivity, VerdictMetrics,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Probability contributed by each firing detector, capped at 1.0 total.
const RAPID_GROWTH_WEIGHT: f64 = 0.30;
const STEADY_GROWTH_WEIGHT: f64 = 0.25;
const SAW_TOOTH_WEIGHT: f64 = 0.20;
const GC_PRESSURE_WEIGHT: f64 = 0.15;
const MEMORY_THRESHOLD_WEIGHT: f64 = 0.10;

/// Detectors need this many observations before a window analysis counts.
const MIN_WINDOW_POINTS: usize = 5;
/// Post-baseline heap window used by the steady-growth regression.
const HEAP_WINDOW: usize = 10;
/// GC-bearing samples retained for the saw-tooth analysis.
const GC_REDUCTION_WINDOW: usize = 20;
/// Samples considered by the gc-pressure rate computation.
const PRESSURE_WINDOW: usize = 10;
/// Verdict history retained for the query surface.
const VERDICT_HISTORY: usize = 50;

/// Leak detector configuration, extracted from the agent config.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub sensitivity: Sensitivity,
    /// Detector names to run; empty runs all five.
    pub patterns: Vec<String>,
    pub baseline_duration: Duration,
    pub baseline_samples: usize,
    /// Relative growth over baseline that counts as rapid.
    pub growth_threshold: f64,
    /// GC events per minute that count as pressure.
    pub gc_frequency_threshold: f64,
    /// used/limit ratio that counts as critical.
    pub heap_threshold: f64,
    /// Minimum acceptable mean heap reduction per GC.
    pub gc_efficiency_threshold: f64,
    /// R² needed for the steady-growth fit.
    pub confidence_threshold: f64,
}

impl DetectorConfig {
    pub fn from_agent(config: &AgentConfig) -> Self {
        Self {
            sensitivity: config.detection.sensitivity,
            patterns: effective_patterns(config),
            baseline_duration: Duration::from_millis(config.detection.baseline.duration_ms),
            baseline_samples: config.detection.baseline.samples,
            growth_threshold: config.threshold.growth,
            gc_frequency_threshold: config.threshold.gc_frequency,
            heap_threshold: config.threshold.heap,
            gc_efficiency_threshold: config.threshold.gc_efficiency,
            confidence_threshold: config.detection.thresholds.confidence,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::from_agent(&AgentConfig::default())
    }
}

/// Resolve the enabled pattern set from the explicit list and the
/// algorithm toggles. `memory-threshold` always runs.
fn effective_patterns(config: &AgentConfig) -> Vec<String> {
    let algorithms = &config.detection.algorithms;
    let all = [
        "rapid-growth",
        "steady-growth",
        "saw-tooth",
        "gc-pressure",
        "memory-threshold",
    ];
    all.iter()
        .filter(|name| {
            config.detection.patterns.is_empty()
                || config.detection.patterns.iter().any(|p| p == *name)
        })
        .filter(|name| match **name {
            "rapid-growth" | "steady-growth" => algorithms.growth,
            "saw-tooth" => algorithms.retention,
            "gc-pressure" => algorithms.frequency,
            _ => true,
        })
        .map(|name| name.to_string())
        .collect()
}

/// Verdict strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictKind {
    Leak,
    Warning,
}

/// What one `observe` call produced.
#[derive(Debug, Default)]
pub struct Observation {
    pub baseline_established: Option<Baseline>,
    pub verdict: Option<(VerdictKind, LeakVerdict)>,
    /// Set when the sample violated `used <= total <= limit`.
    pub invariant_violation: bool,
}

struct Finding {
    factor: &'static str,
    weight: f64,
    recommendations: &'static [&'static str],
}

/// The leak detector. Single-owner: mutated by the sampler task only.
pub struct LeakDetector {
    config: DetectorConfig,
    started_at: Instant,
    baseline: Option<Baseline>,
    baseline_heap: Vec<f64>,
    baseline_gc: Vec<f64>,
    heap_window: MetricRing<f64>,
    gc_reductions: MetricRing<f64>,
    pressure_window: MetricRing<(DateTime<Utc>, usize)>,
    prev_heap_used: Option<f64>,
    verdicts: MetricRing<LeakVerdict>,
}

impl LeakDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            started_at: Instant::now(),
            baseline: None,
            baseline_heap: Vec::new(),
            baseline_gc: Vec::new(),
            heap_window: MetricRing::new(HEAP_WINDOW),
            gc_reductions: MetricRing::new(GC_REDUCTION_WINDOW),
            pressure_window: MetricRing::new(PRESSURE_WINDOW),
            prev_heap_used: None,
            verdicts: MetricRing::new(VERDICT_HISTORY),
        }
    }

    pub fn baseline(&self) -> Option<&Baseline> {
        self.baseline.as_ref()
    }

    pub fn is_baseline_established(&self) -> bool {
        self.baseline.is_some()
    }

    /// Recent verdicts, oldest first.
    pub fn recent_verdicts(&self) -> Vec<LeakVerdict> {
        self.verdicts.to_vec()
    }

    /// Drop the baseline and every retained window; the next samples
    /// start a fresh baseline phase.
    pub fn reset(&mut self) {
        info!("leak detector reset");
        self.started_at = Instant::now();
        self.baseline = None;
        self.baseline_heap.clear();
        self.baseline_gc.clear();
        self.heap_window.clear();
        self.gc_reductions.clear();
        self.pressure_window.clear();
        self.prev_heap_used = None;
        self.verdicts.clear();
    }

    /// Process one sample in arrival order.
    pub fn observe(&mut self, sample: &Sample) -> Observation {
        let mut observation = Observation::default();

        if !sample.heap_invariant_holds() {
            warn!(
                used = sample.heap.used,
                total = sample.heap.total,
                limit = sample.heap.limit,
                "sample violates heap ordering invariant"
            );
            observation.invariant_violation = true;
        }

        if self.baseline.is_none() {
            self.baseline_heap.push(sample.heap.used as f64);
            self.baseline_gc.push(sample.gc.len() as f64);

            let elapsed = self.started_at.elapsed();
            if elapsed >= self.config.baseline_duration
                || self.baseline_heap.len() >= self.config.baseline_samples
            {
                let baseline = Baseline {
                    avg_heap_size: mean(&self.baseline_heap),
                    std_dev_heap_size: std_dev(&self.baseline_heap),
                    avg_gc_frequency: mean(&self.baseline_gc),
                    samples_used: self.baseline_heap.len(),
                    established_at: Utc::now(),
                };
                info!(
                    avg_heap = baseline.avg_heap_size,
                    samples = baseline.samples_used,
                    "baseline established"
                );
                self.baseline = Some(baseline.clone());
                observation.baseline_established = Some(baseline);
            }
            return observation;
        }

        self.update_windows(sample);
        observation.verdict = self.classify(sample);
        if let Some((_, verdict)) = &observation.verdict {
            self.verdicts.push(verdict.clone());
        }
        observation
    }

    fn update_windows(&mut self, sample: &Sample) {
        let used = sample.heap.used as f64;

        // Saw-tooth needs the pre-collection value, which is the previous
        // sample's usage for any sample bearing GC events.
        if !sample.gc.is_empty() {
            if let Some(prev) = self.prev_heap_used {
                if prev > 0.0 {
                    self.gc_reductions.push((prev - used) / prev);
                }
            }
        }

        self.heap_window.push(used);
        self.pressure_window.push((sample.timestamp, sample.gc.len()));
        self.prev_heap_used = Some(used);
    }

    fn pattern_enabled(&self, name: &str) -> bool {
        self.config.patterns.is_empty() || self.config.patterns.iter().any(|p| p == name)
    }

    fn classify(&self, sample: &Sample) -> Option<(VerdictKind, LeakVerdict)> {
        let mut findings = Vec::new();

        if self.pattern_enabled("rapid-growth") {
            if let Some(f) = self.detect_rapid_growth(sample) {
                findings.push(f);
            }
        }
        if self.pattern_enabled("steady-growth") {
            if let Some(f) = self.detect_steady_growth() {
                findings.push(f);
            }
        }
        if self.pattern_enabled("saw-tooth") {
            if let Some(f) = self.detect_saw_tooth() {
                findings.push(f);
            }
        }
        if self.pattern_enabled("gc-pressure") {
            if let Some(f) = self.detect_gc_pressure() {
                findings.push(f);
            }
        }
        if self.pattern_enabled("memory-threshold") {
            if let Some(f) = self.detect_memory_threshold(sample) {
                findings.push(f);
            }
        }

        if findings.is_empty() {
            return None;
        }

        let mut probability = 0.0;
        let mut factors = Vec::new();
        let mut recommendations: Vec<String> = Vec::new();
        for finding in &findings {
            probability += finding.weight;
            factors.push(finding.factor.to_string());
            for rec in finding.recommendations {
                if !recommendations.iter().any(|r| r == rec) {
                    recommendations.push((*rec).to_string());
                }
            }
        }
        let probability = probability.min(1.0);

        let verdict = LeakVerdict {
            probability,
            factors,
            timestamp: sample.timestamp,
            metrics: VerdictMetrics {
                heap_used: sample.heap.used,
                heap_total: sample.heap.total,
                heap_limit: sample.heap.limit,
            },
            recommendations,
        };

        let threshold = self.config.sensitivity.verdict_threshold();
        if probability > threshold {
            debug!(probability, "leak verdict");
            Some((VerdictKind::Leak, verdict))
        } else if probability > 0.3 {
            Some((VerdictKind::Warning, verdict))
        } else {
            None
        }
    }

    fn detect_rapid_growth(&self, sample: &Sample) -> Option<Finding> {
        let baseline = self.baseline.as_ref()?;
        if baseline.avg_heap_size == 0.0 {
            return None;
        }
        let growth = (sample.heap.used as f64 - baseline.avg_heap_size) / baseline.avg_heap_size;
        if growth > self.config.growth_threshold {
            Some(Finding {
                factor: "rapid-growth",
                weight: RAPID_GROWTH_WEIGHT,
                recommendations: &[
                    "Check for unbounded data structures such as growing vectors, maps, or caches",
                    "Review recent changes that allocate on hot paths",
                ],
            })
        } else {
            None
        }
    }

    fn detect_steady_growth(&self) -> Option<Finding> {
        let values = self.heap_window.to_vec();
        if values.len() < MIN_WINDOW_POINTS {
            return None;
        }
        let fit = linear_regression(&values)?;
        let r_squared = fit.r_squared?;
        if fit.slope > 0.0 && r_squared > self.config.confidence_threshold {
            Some(Finding {
                factor: "steady-growth",
                weight: STEADY_GROWTH_WEIGHT,
                recommendations: &[
                    "Look for callbacks or subscribers registered repeatedly and never removed",
                    "Audit long-lived collections for missing eviction",
                ],
            })
        } else {
            None
        }
    }

    fn detect_saw_tooth(&self) -> Option<Finding> {
        let reductions = self.gc_reductions.to_vec();
        if reductions.len() < MIN_WINDOW_POINTS {
            return None;
        }
        if mean(&reductions) < self.config.gc_efficiency_threshold {
            Some(Finding {
                factor: "saw-tooth",
                weight: SAW_TOOTH_WEIGHT,
                recommendations: &[
                    "Collections reclaim little memory; look for objects pinned by long-lived references",
                    "Consider weak handles for cache-like structures",
                ],
            })
        } else {
            None
        }
    }

    fn detect_gc_pressure(&self) -> Option<Finding> {
        let window = self.pressure_window.to_vec();
        if window.len() < MIN_WINDOW_POINTS {
            return None;
        }
        let total: usize = window.iter().map(|(_, count)| count).sum();
        let span = window.last().unwrap().0 - window.first().unwrap().0;
        let minutes = span.num_milliseconds() as f64 / 60_000.0;
        if minutes <= 0.0 {
            return None;
        }
        if total as f64 / minutes > self.config.gc_frequency_threshold {
            Some(Finding {
                factor: "gc-pressure",
                weight: GC_PRESSURE_WEIGHT,
                recommendations: &[
                    "High collection frequency; reduce allocation churn on hot paths",
                    "Batch small allocations or reuse buffers",
                ],
            })
        } else {
            None
        }
    }

    fn detect_memory_threshold(&self, sample: &Sample) -> Option<Finding> {
        if sample.heap.limit == 0 {
            return None;
        }
        let ratio = sample.heap.used as f64 / sample.heap.limit as f64;
        if ratio > self.config.heap_threshold {
            Some(Finding {
                factor: "memory-threshold",
                weight: MEMORY_THRESHOLD_WEIGHT,
                recommendations: &[
                    "Heap usage is approaching the configured limit; raise it or reduce retained data",
                    "Capture a snapshot now and compare against an earlier one to locate the growth",
                ],
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use heapwatch_common::{CpuStats, GcEvent, GcKind, HeapStats, OsStats};

    const MB: u64 = 1024 * 1024;

    fn config(sensitivity: Sensitivity) -> DetectorConfig {
        DetectorConfig {
            sensitivity,
            patterns: Vec::new(),
            baseline_duration: Duration::from_secs(3600),
            baseline_samples: 10,
            growth_threshold: 0.10,
            gc_frequency_threshold: 10.0,
            heap_threshold: 0.85,
            gc_efficiency_threshold: 0.10,
            confidence_threshold: 0.80,
        }
    }

    fn sample_at(offset_secs: i64, used: u64, limit: u64, gc: usize) -> Sample {
        Sample {
            timestamp: Utc::now() + TimeDelta::seconds(offset_secs),
            heap: HeapStats {
                used,
                total: used,
                limit,
                ..Default::default()
            },
            gc: (0..gc)
                .map(|_| GcEvent {
                    kind: GcKind::Scavenge,
                    duration_ms: 1.0,
                    flags: 0,
                })
                .collect(),
            event_loop_delay_ms: 0.0,
            cpu: CpuStats::default(),
            os: OsStats::default(),
        }
    }

    fn establish_baseline(detector: &mut LeakDetector, used: u64) -> Baseline {
        let mut established = None;
        for i in 0..10 {
            let obs = detector.observe(&sample_at(i, used, 1024 * MB, 0));
            if let Some(b) = obs.baseline_established {
                established = Some(b);
            }
        }
        established.expect("baseline should be established by the tenth sample")
    }

    #[test]
    fn baseline_promotes_exactly_once_on_sample_count() {
        let mut detector = LeakDetector::new(config(Sensitivity::Medium));

        for i in 0..9 {
            let obs = detector.observe(&sample_at(i, 100 * MB, 1024 * MB, 0));
            assert!(obs.baseline_established.is_none());
            assert!(obs.verdict.is_none());
        }

        let obs = detector.observe(&sample_at(9, 100 * MB, 1024 * MB, 0));
        let baseline = obs.baseline_established.expect("tenth sample promotes");
        assert_eq!(baseline.samples_used, 10);
        assert!((baseline.avg_heap_size - (100 * MB) as f64).abs() < 1.0);
        assert!(baseline.std_dev_heap_size < 1.0);

        // Never promotes twice.
        let obs = detector.observe(&sample_at(10, 100 * MB, 1024 * MB, 0));
        assert!(obs.baseline_established.is_none());
    }

    #[test]
    fn baseline_promotes_on_elapsed_duration() {
        let mut cfg = config(Sensitivity::Medium);
        cfg.baseline_duration = Duration::from_millis(0);
        cfg.baseline_samples = 1_000;
        let mut detector = LeakDetector::new(cfg);

        let obs = detector.observe(&sample_at(0, 100 * MB, 1024 * MB, 0));
        assert!(obs.baseline_established.is_some());
    }

    #[test]
    fn no_verdict_before_baseline() {
        let mut detector = LeakDetector::new(config(Sensitivity::High));
        for i in 0..9 {
            // Wildly growing heap, but the baseline phase never classifies.
            let obs = detector.observe(&sample_at(i, (i as u64 + 1) * 200 * MB, 4096 * MB, 3));
            assert!(obs.verdict.is_none());
        }
    }

    #[test]
    fn lone_rapid_growth_sits_on_the_band_edge() {
        // A single rapid-growth firing contributes exactly 0.30, and the
        // band comparisons are strict: at high sensitivity (threshold
        // 0.3) neither `> threshold` nor `> 0.3` holds, so nothing is
        // emitted.
        let mut detector = LeakDetector::new(config(Sensitivity::High));
        establish_baseline(&mut detector, 100 * MB);

        let obs = detector.observe(&sample_at(20, 115 * MB, 1024 * MB, 0));
        assert!(obs.verdict.is_none());
    }

    #[test]
    fn rapid_growth_with_pressure_is_a_warning_at_medium_sensitivity() {
        let mut detector = LeakDetector::new(config(Sensitivity::Medium));
        establish_baseline(&mut detector, 100 * MB);

        // Rapid growth (0.30) plus memory threshold (0.10): 0.40 clears
        // the warning band but not the medium leak threshold (0.5).
        let obs = detector.observe(&sample_at(20, 120 * MB, 130 * MB, 0));
        let (kind, verdict) = obs.verdict.expect("both detectors fire");
        assert_eq!(kind, VerdictKind::Warning);
        assert!(verdict.factors.iter().any(|f| f == "rapid-growth"));
        assert!(verdict
            .recommendations
            .iter()
            .any(|r| r.to_lowercase().contains("unbounded data structures")));
        assert!((verdict.probability - 0.40).abs() < 1e-9);
    }

    #[test]
    fn probability_is_monotone_in_firing_set() {
        let mut detector = LeakDetector::new(config(Sensitivity::High));
        establish_baseline(&mut detector, 100 * MB);

        // Rapid growth and memory threshold together.
        let obs = detector.observe(&sample_at(20, 120 * MB, 130 * MB, 0));
        let p_one = obs.verdict.unwrap().1.probability;

        // A clean linear climb adds steady-growth to the firing set once
        // the regression window holds five points.
        let mut obs = Observation::default();
        for i in 1..5u64 {
            obs = detector.observe(&sample_at(
                20 + i as i64,
                (120 + 2 * i) * MB,
                130 * MB,
                0,
            ));
        }
        let p_two = obs.verdict.unwrap().1.probability;
        assert!(p_two > p_one);
        assert!(p_two <= 1.0);
    }

    #[test]
    fn steady_growth_needs_confident_fit_and_full_window() {
        let mut cfg = config(Sensitivity::High);
        cfg.patterns = vec!["steady-growth".into(), "rapid-growth".into()];
        let mut detector = LeakDetector::new(cfg);
        establish_baseline(&mut detector, 100 * MB);

        // Clean linear climb, well above the baseline: until the
        // regression window holds five points only rapid-growth fires,
        // and its lone 0.30 never clears the strict band comparison.
        for i in 0..4u64 {
            let obs = detector.observe(&sample_at(
                20 + i as i64,
                (150 + 5 * i) * MB,
                4096 * MB,
                0,
            ));
            assert!(obs.verdict.is_none(), "window too small at sample {}", i);
        }
        let obs = detector.observe(&sample_at(24, 170 * MB, 4096 * MB, 0));
        let (kind, verdict) = obs.verdict.expect("steady growth joins rapid growth");
        assert_eq!(kind, VerdictKind::Leak);
        assert!(verdict.factors.iter().any(|f| f == "steady-growth"));
        assert!(verdict.factors.iter().any(|f| f == "rapid-growth"));
        assert!((verdict.probability - 0.55).abs() < 1e-9);
    }

    #[test]
    fn flat_series_never_fires_steady_growth() {
        let mut cfg = config(Sensitivity::High);
        cfg.patterns = vec!["steady-growth".into()];
        let mut detector = LeakDetector::new(cfg);
        establish_baseline(&mut detector, 100 * MB);

        for i in 0..10 {
            let obs = detector.observe(&sample_at(20 + i, 100 * MB, 4096 * MB, 0));
            assert!(obs.verdict.is_none());
        }
    }

    #[test]
    fn saw_tooth_fires_when_collections_reclaim_nothing() {
        // Pair with rapid-growth to clear the emission band.
        let mut cfg = config(Sensitivity::High);
        cfg.patterns = vec!["saw-tooth".into(), "rapid-growth".into()];
        let mut detector = LeakDetector::new(cfg);
        establish_baseline(&mut detector, 100 * MB);

        // Every sample bears a GC yet usage never drops: reductions ~0.
        let mut obs = detector.observe(&sample_at(20, 150 * MB, 4096 * MB, 1));
        for i in 1..7 {
            obs = detector.observe(&sample_at(20 + i, 150 * MB, 4096 * MB, 1));
        }
        let (_, verdict) = obs.verdict.expect("saw-tooth fires");
        assert!(verdict.factors.iter().any(|f| f == "saw-tooth"));
        assert!((verdict.probability - 0.50).abs() < 1e-9);
    }

    #[test]
    fn lone_memory_threshold_stays_below_the_emission_band() {
        let mut cfg = config(Sensitivity::High);
        cfg.patterns = vec!["memory-threshold".into()];
        let mut detector = LeakDetector::new(cfg);
        establish_baseline(&mut detector, 100 * MB);

        // 0.9 of limit exceeds the 0.85 threshold, but a single
        // 0.1-weight firing never reaches 0.3.
        let obs = detector.observe(&sample_at(20, 90 * MB, 100 * MB, 0));
        assert!(obs.verdict.is_none());
    }

    #[test]
    fn memory_threshold_contributes_alongside_rapid_growth() {
        let mut cfg = config(Sensitivity::High);
        cfg.patterns = vec!["memory-threshold".into(), "rapid-growth".into()];
        let mut detector = LeakDetector::new(cfg);
        establish_baseline(&mut detector, 50 * MB);

        let obs = detector.observe(&sample_at(20, 90 * MB, 100 * MB, 0));
        let (kind, verdict) = obs.verdict.expect("both fire");
        assert_eq!(kind, VerdictKind::Leak);
        assert!(verdict.factors.iter().any(|f| f == "memory-threshold"));
        assert!((verdict.probability - 0.40).abs() < 1e-9);
    }

    #[test]
    fn gc_pressure_counts_events_per_minute() {
        let mut cfg = config(Sensitivity::High);
        cfg.patterns = vec!["gc-pressure".into(), "rapid-growth".into()];
        let mut detector = LeakDetector::new(cfg);
        establish_baseline(&mut detector, 100 * MB);

        // Ten samples one second apart, one GC each: ~66 events/minute,
        // far above the 10/minute threshold.
        let mut obs = Observation::default();
        for i in 0..10 {
            obs = detector.observe(&sample_at(20 + i, 150 * MB, 4096 * MB, 1));
        }
        let (_, verdict) = obs.verdict.expect("pressure fires");
        assert!(verdict.factors.iter().any(|f| f == "gc-pressure"));
    }

    #[test]
    fn algorithm_toggles_disable_pattern_families() {
        let mut agent_config = AgentConfig::default();
        agent_config.detection.algorithms.growth = false;
        agent_config.detection.algorithms.retention = false;
        let cfg = DetectorConfig::from_agent(&agent_config);
        assert!(!cfg.patterns.iter().any(|p| p == "rapid-growth"));
        assert!(!cfg.patterns.iter().any(|p| p == "steady-growth"));
        assert!(!cfg.patterns.iter().any(|p| p == "saw-tooth"));
        assert!(cfg.patterns.iter().any(|p| p == "gc-pressure"));
        assert!(cfg.patterns.iter().any(|p| p == "memory-threshold"));
    }

    #[test]
    fn invariant_violation_is_reported_not_fatal() {
        let mut detector = LeakDetector::new(config(Sensitivity::Medium));
        let mut bad = sample_at(0, 200 * MB, 100 * MB, 0);
        bad.heap.total = 150 * MB;
        let obs = detector.observe(&bad);
        assert!(obs.invariant_violation);
    }

    #[test]
    fn reset_restarts_the_baseline_phase() {
        let mut detector = LeakDetector::new(config(Sensitivity::Medium));
        establish_baseline(&mut detector, 100 * MB);
        assert!(detector.is_baseline_established());

        detector.reset();
        assert!(!detector.is_baseline_established());
        let obs = detector.observe(&sample_at(0, 500 * MB, 1024 * MB, 0));
        assert!(obs.verdict.is_none());
    }
}
