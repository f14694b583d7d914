//! Memory hotspot analysis
//!
//! Tracks recurring pressure patterns over a retained window of samples
//! and raises typed hotspots: overall memory growth, per-space object
//! growth, heap-space pressure, and repeated allocation patterns.
//! Hotspots are upserted on every match and expire after the retention
//! period without a fresh sighting.

use chrono::{DateTime, TimeDelta, Utc};
use heapwatch_common::config::HotspotConfig;
use heapwatch_common::{Error, Hotspot, HotspotKind, MetricRing, Result, Sample, Severity};
use std::collections::HashMap;
use tracing::{debug, info};

/// Samples considered by each analysis pass.
const ANALYSIS_WINDOW: usize = 10;
/// Width of the RSS bucketing constant, 100 MiB.
const RSS_BUCKET_BASE: f64 = 100.0 * 1024.0 * 1024.0;

/// One analysis pass outcome.
#[derive(Debug, Clone)]
pub enum HotspotEvent {
    /// First sighting of this hotspot id.
    Detected(Hotspot),
    /// Retention expired without a fresh sighting.
    Expired { id: String },
}

/// Aggregate counters for the query surface.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct HotspotStats {
    pub active: usize,
    pub detected: u64,
    pub expired: u64,
    pub resolved: u64,
}

/// Filter for [`HotspotAnalyzer::hotspots`].
#[derive(Debug, Clone, Default)]
pub struct HotspotFilter {
    pub kind: Option<HotspotKind>,
    pub min_severity: Option<Severity>,
}

struct WindowEntry {
    heap_used: u64,
    heap_total: u64,
    rss: u64,
    spaces: Vec<(String, u64, u64)>,
    pattern_key: String,
}

/// The hotspot analyzer. Single-owner: mutated by its sampling task only.
pub struct HotspotAnalyzer {
    config: HotspotConfig,
    window: MetricRing<WindowEntry>,
    hotspots: HashMap<String, Hotspot>,
    stats: HotspotStats,
}

impl HotspotAnalyzer {
    pub fn new(config: HotspotConfig) -> Self {
        Self {
            config,
            window: MetricRing::new(ANALYSIS_WINDOW),
            hotspots: HashMap::new(),
            stats: HotspotStats::default(),
        }
    }

    fn category_enabled(&self, name: &str) -> bool {
        self.config.categories.get(name).copied().unwrap_or(true)
    }

    /// Feed one sample and run every enabled analysis over the retained
    /// window. Returns detections and expirations in that order.
    pub fn observe(&mut self, sample: &Sample) -> Vec<HotspotEvent> {
        let now = sample.timestamp;
        let entry = WindowEntry {
            heap_used: sample.heap.used,
            heap_total: sample.heap.total.max(1),
            rss: sample.heap.physical,
            spaces: sample
                .heap
                .spaces
                .iter()
                .map(|s| (s.name.clone(), s.used, s.size.max(1)))
                .collect(),
            pattern_key: Self::pattern_key(sample),
        };
        self.window.push(entry);

        let mut events = Vec::new();
        if self.category_enabled("memory-growth") {
            self.analyze_memory_growth(now, &mut events);
        }
        if self.category_enabled("object-growth") {
            self.analyze_object_growth(now, &mut events);
        }
        if self.category_enabled("heap-space-pressure") {
            self.analyze_space_pressure(now, &mut events);
        }
        if self.category_enabled("allocation-pattern") {
            self.analyze_allocation_pattern(now, &mut events);
        }

        self.expire_stale(now, &mut events);
        events
    }

    /// Coarse, stable bucketing over the sample's pressure shape.
    fn pattern_key(sample: &Sample) -> String {
        let usage_ratio = sample.heap.used as f64 / sample.heap.total.max(1) as f64;
        let rss = sample.heap.physical as f64;
        let rss_ratio = rss / (rss + RSS_BUCKET_BASE);
        let usage_bucket = ((usage_ratio * 10.0) as u32).min(9);
        let rss_bucket = ((rss_ratio * 10.0) as u32).min(9);
        format!("u{}r{}", usage_bucket, rss_bucket)
    }

    fn analyze_memory_growth(&mut self, now: DateTime<Utc>, events: &mut Vec<HotspotEvent>) {
        let (first, latest) = match (self.window.first(), self.window.last()) {
            (Some(f), Some(l)) if self.window.len() >= 2 && f.heap_used > 0 => (f, l),
            _ => return,
        };
        let growth =
            (latest.heap_used as f64 - first.heap_used as f64) / first.heap_used as f64;
        if growth <= self.config.thresholds.growth {
            return;
        }
        let severity = if growth > self.config.thresholds.growth * 4.0 {
            Severity::Critical
        } else if growth > self.config.thresholds.growth * 2.0 {
            Severity::High
        } else {
            Severity::Medium
        };
        let details = serde_json::json!({
            "growthRatio": growth,
            "windowSamples": self.window.len(),
            "firstHeapUsed": first.heap_used,
            "latestHeapUsed": latest.heap_used,
        });
        self.upsert(
            "memory-growth".to_string(),
            HotspotKind::MemoryGrowth,
            severity,
            now,
            details,
            &[
                "Heap usage grew across the retained window; check recently added caches",
                "Compare two snapshots to attribute the growth",
            ],
            events,
        );
    }

    fn analyze_object_growth(&mut self, now: DateTime<Utc>, events: &mut Vec<HotspotEvent>) {
        if self.window.len() < 2 {
            return;
        }
        let entries: Vec<&WindowEntry> = self.window.iter().collect();
        let previous = entries[entries.len() - 2];
        let latest = entries[entries.len() - 1];

        let mut grown = Vec::new();
        for (name, used, _size) in &latest.spaces {
            if *used < self.config.thresholds.size {
                continue;
            }
            let Some((_, prev_used, _)) =
                previous.spaces.iter().find(|(n, _, _)| n == name)
            else {
                continue;
            };
            if *prev_used == 0 {
                continue;
            }
            let growth = (*used as f64 - *prev_used as f64) / *prev_used as f64;
            if growth > self.config.thresholds.growth {
                grown.push((name.clone(), *used, growth));
            }
        }

        for (name, used, growth) in grown {
            let severity = if growth > self.config.thresholds.growth * 2.0 {
                Severity::High
            } else {
                Severity::Medium
            };
            let details = serde_json::json!({
                "space": name,
                "usedBytes": used,
                "growthRatio": growth,
            });
            self.upsert(
                format!("object-{}", name),
                HotspotKind::ObjectGrowth,
                severity,
                now,
                details,
                &[
                    "A single allocator space is growing between samples",
                    "Inspect the structures mapped to this space for unbounded retention",
                ],
                events,
            );
        }
    }

    fn analyze_space_pressure(&mut self, now: DateTime<Utc>, events: &mut Vec<HotspotEvent>) {
        let pressure_threshold = self.config.hotspot_threshold;
        let Some(latest) = self.window.last() else {
            return;
        };
        let pressured: Vec<(String, f64)> = latest
            .spaces
            .iter()
            .filter_map(|(name, used, size)| {
                let ratio = *used as f64 / *size as f64;
                (ratio > pressure_threshold).then(|| (name.clone(), ratio))
            })
            .collect();

        for (name, ratio) in pressured {
            let severity = if ratio > 0.95 {
                Severity::Critical
            } else {
                Severity::High
            };
            let details = serde_json::json!({
                "space": name,
                "usageRatio": ratio,
            });
            self.upsert(
                format!("heap-space-{}", name),
                HotspotKind::HeapSpacePressure,
                severity,
                now,
                details,
                &[
                    "An allocator space is close to its capacity",
                    "Raise the space limit or reduce retained allocations in it",
                ],
                events,
            );
        }
    }

    fn analyze_allocation_pattern(&mut self, now: DateTime<Utc>, events: &mut Vec<HotspotEvent>) {
        let Some(latest_key) = self.window.last().map(|e| e.pattern_key.clone()) else {
            return;
        };
        let count = self
            .window
            .iter()
            .filter(|e| e.pattern_key == latest_key)
            .count() as u64;
        if count < self.config.thresholds.frequency {
            return;
        }
        let details = serde_json::json!({
            "patternKey": latest_key,
            "occurrencesInWindow": count,
        });
        self.upsert(
            format!("pattern-{}", latest_key),
            HotspotKind::AllocationPattern,
            Severity::Low,
            now,
            details,
            &[
                "The same pressure shape keeps recurring",
                "Correlate the pattern window with scheduled workloads",
            ],
            events,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn upsert(
        &mut self,
        id: String,
        kind: HotspotKind,
        severity: Severity,
        now: DateTime<Utc>,
        details: serde_json::Value,
        recommendations: &[&str],
        events: &mut Vec<HotspotEvent>,
    ) {
        match self.hotspots.get_mut(&id) {
            Some(existing) => {
                existing.occurrences += 1;
                existing.last_seen = now;
                existing.details = details;
                // Severity only relaxes upward.
                if severity > existing.severity {
                    existing.severity = severity;
                }
            }
            None => {
                let hotspot = Hotspot {
                    id: id.clone(),
                    kind,
                    severity,
                    first_seen: now,
                    last_seen: now,
                    occurrences: 1,
                    details,
                    recommendations: recommendations.iter().map(|r| r.to_string()).collect(),
                    resolved: false,
                    resolved_at: None,
                };
                debug!(id = %id, ?kind, "hotspot detected");
                self.stats.detected += 1;
                self.hotspots.insert(id, hotspot.clone());
                events.push(HotspotEvent::Detected(hotspot));
            }
        }
    }

    fn expire_stale(&mut self, now: DateTime<Utc>, events: &mut Vec<HotspotEvent>) {
        let retention = TimeDelta::milliseconds(self.config.retention_period_ms as i64);
        let stale: Vec<String> = self
            .hotspots
            .iter()
            .filter(|(_, h)| now - h.last_seen > retention)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            self.hotspots.remove(&id);
            self.stats.expired += 1;
            info!(id = %id, "hotspot expired");
            events.push(HotspotEvent::Expired { id });
        }
    }

    /// Mark a hotspot resolved and drop it from the active map.
    pub fn resolve(&mut self, id: &str, _resolution: &str) -> Result<Hotspot> {
        let mut hotspot = self
            .hotspots
            .remove(id)
            .ok_or_else(|| Error::Analysis(format!("unknown hotspot id '{}'", id)))?;
        hotspot.resolved = true;
        hotspot.resolved_at = Some(Utc::now());
        self.stats.resolved += 1;
        Ok(hotspot)
    }

    /// Active hotspots matching the filter, most severe first.
    pub fn hotspots(&self, filter: &HotspotFilter) -> Vec<Hotspot> {
        let mut result: Vec<Hotspot> = self
            .hotspots
            .values()
            .filter(|h| filter.kind.map_or(true, |k| h.kind == k))
            .filter(|h| filter.min_severity.map_or(true, |s| h.severity >= s))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.severity.cmp(&a.severity).then(b.last_seen.cmp(&a.last_seen)));
        result
    }

    /// Coarse map of the current memory landscape for the query surface.
    pub fn memory_map(&self) -> serde_json::Value {
        let latest = self.window.last();
        serde_json::json!({
            "windowSamples": self.window.len(),
            "heapUsed": latest.map(|e| e.heap_used).unwrap_or(0),
            "rss": latest.map(|e| e.rss).unwrap_or(0),
            "spaces": latest
                .map(|e| {
                    e.spaces
                        .iter()
                        .map(|(name, used, size)| {
                            serde_json::json!({
                                "name": name,
                                "used": used,
                                "size": size,
                            })
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            "activeHotspots": self.hotspots.len(),
        })
    }

    pub fn stats(&self) -> HotspotStats {
        HotspotStats {
            active: self.hotspots.len(),
            ..self.stats
        }
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.hotspots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapwatch_common::config::HotspotThresholds;
    use heapwatch_common::{CpuStats, HeapSpace, HeapStats, OsStats};

    const MB: u64 = 1024 * 1024;

    fn config() -> HotspotConfig {
        HotspotConfig {
            enabled: true,
            sample_interval_ms: 1_000,
            retention_period_ms: 600_000,
            hotspot_threshold: 0.8,
            categories: HashMap::new(),
            thresholds: HotspotThresholds {
                growth: 0.15,
                frequency: 5,
                size: MB,
            },
        }
    }

    fn sample(used: u64, total: u64, rss: u64, spaces: Vec<HeapSpace>) -> Sample {
        Sample {
            timestamp: Utc::now(),
            heap: HeapStats {
                used,
                total,
                limit: total * 2,
                physical: rss,
                spaces,
                ..Default::default()
            },
            gc: Vec::new(),
            event_loop_delay_ms: 0.0,
            cpu: CpuStats::default(),
            os: OsStats::default(),
        }
    }

    fn space(name: &str, used: u64, size: u64) -> HeapSpace {
        HeapSpace {
            name: name.into(),
            size,
            used,
            available: size.saturating_sub(used),
            physical: used,
        }
    }

    #[test]
    fn memory_growth_upserts_a_single_hotspot() {
        let mut analyzer = HotspotAnalyzer::new(config());

        let mut detections = 0;
        for i in 0..6u64 {
            // 100 -> 200 MB across the window: 100% growth.
            let events = analyzer.observe(&sample((100 + i * 20) * MB, 512 * MB, 0, vec![]));
            detections += events
                .iter()
                .filter(|e| matches!(e, HotspotEvent::Detected(_)))
                .count();
        }

        assert_eq!(detections, 1, "upserts never re-detect");
        let active = analyzer.hotspots(&HotspotFilter::default());
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "memory-growth");
        assert!(active[0].occurrences > 1);
    }

    #[test]
    fn severity_only_relaxes_upward() {
        let mut analyzer = HotspotAnalyzer::new(config());

        // Steep growth first: critical.
        analyzer.observe(&sample(100 * MB, 2048 * MB, 0, vec![]));
        analyzer.observe(&sample(300 * MB, 2048 * MB, 0, vec![]));
        let severity_high = analyzer.hotspots(&HotspotFilter::default())[0].severity;
        assert_eq!(severity_high, Severity::Critical);

        // Window flattens out to mild growth; severity must not drop.
        for _ in 0..8 {
            analyzer.observe(&sample(310 * MB, 2048 * MB, 0, vec![]));
        }
        analyzer.observe(&sample(360 * MB, 2048 * MB, 0, vec![]));
        let active = analyzer.hotspots(&HotspotFilter::default());
        if let Some(h) = active.iter().find(|h| h.id == "memory-growth") {
            assert_eq!(h.severity, Severity::Critical);
        }
    }

    #[test]
    fn object_growth_tracks_individual_spaces() {
        let mut analyzer = HotspotAnalyzer::new(config());

        analyzer.observe(&sample(
            100 * MB,
            512 * MB,
            0,
            vec![space("malloc", 10 * MB, 100 * MB)],
        ));
        let events = analyzer.observe(&sample(
            100 * MB,
            512 * MB,
            0,
            vec![space("malloc", 20 * MB, 100 * MB)],
        ));

        let detected: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                HotspotEvent::Detected(h) => Some(h.id.clone()),
                _ => None,
            })
            .collect();
        assert!(detected.contains(&"object-malloc".to_string()));
    }

    #[test]
    fn tiny_spaces_are_ignored_by_object_growth() {
        let mut analyzer = HotspotAnalyzer::new(config());
        analyzer.observe(&sample(10 * MB, 512 * MB, 0, vec![space("small", 1000, 4096)]));
        let events = analyzer.observe(&sample(
            10 * MB,
            512 * MB,
            0,
            vec![space("small", 4000, 4096)],
        ));
        assert!(!events
            .iter()
            .any(|e| matches!(e, HotspotEvent::Detected(h) if h.id == "object-small")));
    }

    #[test]
    fn space_pressure_keys_by_space_name() {
        let mut analyzer = HotspotAnalyzer::new(config());
        let events = analyzer.observe(&sample(
            100 * MB,
            512 * MB,
            0,
            vec![
                space("hot", 95 * MB, 100 * MB),
                space("cold", 10 * MB, 100 * MB),
            ],
        ));
        let detected: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                HotspotEvent::Detected(h) => Some((h.id.clone(), h.severity)),
                _ => None,
            })
            .collect();
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].0, "heap-space-hot");
        assert_eq!(detected[0].1, Severity::High);
    }

    #[test]
    fn allocation_pattern_needs_recurrence() {
        let mut analyzer = HotspotAnalyzer::new(config());

        // Identical pressure shape five times reaches the frequency bar.
        let mut pattern_seen = false;
        for _ in 0..5 {
            let events = analyzer.observe(&sample(100 * MB, 200 * MB, 50 * MB, vec![]));
            pattern_seen |= events
                .iter()
                .any(|e| matches!(e, HotspotEvent::Detected(h) if h.kind == HotspotKind::AllocationPattern));
        }
        assert!(pattern_seen);
    }

    #[test]
    fn resolve_removes_and_marks() {
        let mut analyzer = HotspotAnalyzer::new(config());
        analyzer.observe(&sample(100 * MB, 512 * MB, 0, vec![]));
        analyzer.observe(&sample(200 * MB, 512 * MB, 0, vec![]));

        let resolved = analyzer.resolve("memory-growth", "fixed the cache").unwrap();
        assert!(resolved.resolved);
        assert!(resolved.resolved_at.is_some());
        assert!(analyzer.hotspots(&HotspotFilter::default()).is_empty());
        assert!(analyzer.resolve("memory-growth", "again").is_err());
        assert_eq!(analyzer.stats().resolved, 1);
    }

    #[test]
    fn stale_hotspots_expire() {
        let mut cfg = config();
        cfg.retention_period_ms = 50;
        let mut analyzer = HotspotAnalyzer::new(cfg);

        analyzer.observe(&sample(100 * MB, 512 * MB, 0, vec![]));
        analyzer.observe(&sample(200 * MB, 512 * MB, 0, vec![]));
        assert_eq!(analyzer.stats().active, 1);

        // A flat sample after the retention window: no fresh sighting,
        // so the growth hotspot drops out.
        std::thread::sleep(std::time::Duration::from_millis(60));
        let events = analyzer.observe(&sample(100 * MB, 512 * MB, 0, vec![]));
        assert!(events
            .iter()
            .any(|e| matches!(e, HotspotEvent::Expired { id } if id == "memory-growth")));
        assert_eq!(analyzer.stats().expired, 1);
        assert_eq!(analyzer.stats().active, 0);
    }

    #[test]
    fn filter_by_kind_and_severity() {
        let mut analyzer = HotspotAnalyzer::new(config());
        analyzer.observe(&sample(
            100 * MB,
            512 * MB,
            0,
            vec![space("hot", 99 * MB, 100 * MB)],
        ));
        analyzer.observe(&sample(
            250 * MB,
            512 * MB,
            0,
            vec![space("hot", 99 * MB, 100 * MB)],
        ));

        let pressure_only = analyzer.hotspots(&HotspotFilter {
            kind: Some(HotspotKind::HeapSpacePressure),
            min_severity: None,
        });
        assert!(pressure_only
            .iter()
            .all(|h| h.kind == HotspotKind::HeapSpacePressure));

        let critical_only = analyzer.hotspots(&HotspotFilter {
            kind: None,
            min_severity: Some(Severity::Critical),
        });
        assert!(critical_only.iter().all(|h| h.severity == Severity::Critical));
    }
}
