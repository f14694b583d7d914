//! Agent configuration surface
//!
//! The agent consumes an already-validated [`AgentConfig`]; file loading,
//! environment parsing, and schema validation belong to the embedding
//! binary. Legacy flat fields (`enabled`, `interval`, `production`) are
//! accepted for one major version and folded in during
//! [`AgentConfig::normalize`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct AgentConfig {
    pub monitoring: MonitoringConfig,
    pub threshold: ThresholdConfig,
    pub detection: DetectionConfig,
    pub profiling: ProfilingConfig,
    pub reporting: ReportingConfig,
    pub performance: PerformanceConfig,
    pub alerting: AlertingConfig,
    pub streaming: StreamingConfig,
    pub hotspots: HotspotConfig,
    pub error_handling: ErrorHandlingConfig,

    // Legacy flat fields, accepted for one major version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub production: Option<bool>,
}

impl AgentConfig {
    /// Fold legacy flat fields into their nested homes and drop them.
    ///
    /// `enabled` maps to `detection.enabled`, `interval` to
    /// `monitoring.interval_ms`, and `production` is dropped.
    pub fn normalize(mut self) -> Self {
        if let Some(enabled) = self.enabled.take() {
            tracing::warn!("legacy flat field `enabled` is deprecated, use detection.enabled");
            self.detection.enabled = enabled;
        }
        if let Some(interval) = self.interval.take() {
            tracing::warn!("legacy flat field `interval` is deprecated, use monitoring.interval");
            self.monitoring.interval_ms = interval;
        }
        if self.production.take().is_some() {
            tracing::warn!("legacy flat field `production` is deprecated and ignored");
        }
        self
    }

    /// Validate cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.monitoring.interval_ms == 0 {
            return Err(Error::Configuration(
                "monitoring.interval must be positive".into(),
            ));
        }
        if self.monitoring.min_interval_ms > self.monitoring.max_interval_ms {
            return Err(Error::Configuration(format!(
                "monitoring.minInterval ({}) exceeds monitoring.maxInterval ({})",
                self.monitoring.min_interval_ms, self.monitoring.max_interval_ms
            )));
        }
        for (name, value) in [
            ("threshold.heap", self.threshold.heap),
            ("threshold.rss", self.threshold.rss),
            ("threshold.external", self.threshold.external),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Configuration(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.detection.baseline.samples == 0 {
            return Err(Error::Configuration(
                "detection.baseline.samples must be positive".into(),
            ));
        }
        if self.performance.throttling.max_concurrent == 0 {
            return Err(Error::Configuration(
                "performance.throttling.maxConcurrent must be positive".into(),
            ));
        }
        if self.streaming.enabled && self.streaming.buffer_size == 0 {
            return Err(Error::Configuration(
                "streaming.bufferSize must be positive when streaming is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Sampler scheduling and probe detail level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitoringConfig {
    /// Base sampling interval in milliseconds.
    #[serde(rename = "interval")]
    pub interval_ms: u64,
    /// Collect per-space heap detail.
    pub detailed: bool,
    /// Subscribe to GC notifications when a runtime hook is installed.
    pub gc: bool,
    /// Collect per-process OS counters.
    pub processes: bool,
    /// Let the optimizer move the interval within [min, max].
    pub adaptive_interval: bool,
    #[serde(rename = "minInterval")]
    pub min_interval_ms: u64,
    #[serde(rename = "maxInterval")]
    pub max_interval_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            detailed: true,
            gc: true,
            processes: false,
            adaptive_interval: true,
            min_interval_ms: 5_000,
            max_interval_ms: 300_000,
        }
    }
}

/// Pressure thresholds shared by the detector and analyzers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThresholdConfig {
    /// Heap used / heap limit ratio considered critical.
    pub heap: f64,
    /// RSS / total memory ratio considered critical.
    pub rss: f64,
    /// External memory ratio considered critical.
    pub external: f64,
    /// Relative growth over baseline that counts as rapid growth.
    pub growth: f64,
    /// GC events per minute considered pressure.
    pub gc_frequency: f64,
    /// Minimum acceptable mean heap reduction per GC, as a fraction.
    pub gc_efficiency: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            heap: 0.85,
            rss: 0.90,
            external: 0.80,
            growth: 0.10,
            gc_frequency: 10.0,
            gc_efficiency: 0.10,
        }
    }
}

/// Leak-detection sensitivity bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

impl Sensitivity {
    /// Verdict threshold: probabilities above it emit `leak`.
    pub fn verdict_threshold(self) -> f64 {
        match self {
            Sensitivity::Low => 0.7,
            Sensitivity::Medium => 0.5,
            Sensitivity::High => 0.3,
        }
    }
}

/// Leak detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectionConfig {
    pub enabled: bool,
    pub sensitivity: Sensitivity,
    /// Pattern detector names to run; empty means all.
    pub patterns: Vec<String>,
    pub algorithms: DetectionAlgorithms,
    pub thresholds: DetectionThresholds,
    pub baseline: BaselineConfig,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensitivity: Sensitivity::Medium,
            patterns: Vec::new(),
            algorithms: DetectionAlgorithms::default(),
            thresholds: DetectionThresholds::default(),
            baseline: BaselineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectionAlgorithms {
    pub growth: bool,
    pub retention: bool,
    pub frequency: bool,
    pub clustering: bool,
}

impl Default for DetectionAlgorithms {
    fn default() -> Self {
        Self {
            growth: true,
            retention: true,
            frequency: true,
            clustering: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectionThresholds {
    pub growth: f64,
    pub retention: f64,
    pub frequency: f64,
    pub confidence: f64,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            growth: 0.10,
            retention: 0.70,
            frequency: 10.0,
            confidence: 0.80,
        }
    }
}

/// Baseline promotion window: whichever bound is reached first wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BaselineConfig {
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub samples: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            duration_ms: 60_000,
            samples: 10,
        }
    }
}

/// Sampling profiler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProfilingConfig {
    pub enabled: bool,
    pub sampling: bool,
    pub allocation: bool,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub sample_rate: f64,
    pub stack_depth: usize,
    pub filters: ProfilingFilters,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sampling: true,
            allocation: false,
            duration_ms: 30_000,
            sample_rate: 1.0,
            stack_depth: 16,
            filters: ProfilingFilters::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProfilingFilters {
    pub min_sample_count: usize,
    #[serde(rename = "minDuration")]
    pub min_duration_ms: u64,
}

impl Default for ProfilingFilters {
    fn default() -> Self {
        Self {
            min_sample_count: 5,
            min_duration_ms: 10,
        }
    }
}

/// Report sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReportingConfig {
    pub console: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    pub levels: ReportLevels,
    pub format: ReportFormat,
    pub include_stack: bool,
    pub include_context: bool,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            console: true,
            file: None,
            webhook: None,
            levels: ReportLevels::default(),
            format: ReportFormat::Text,
            include_stack: true,
            include_context: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportLevels {
    pub info: bool,
    pub warn: bool,
    pub error: bool,
    pub debug: bool,
}

impl Default for ReportLevels {
    fn default() -> Self {
        Self {
            info: true,
            warn: true,
            error: true,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Text,
    Json,
}

/// Optimizer and operation-queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PerformanceConfig {
    pub adaptive: bool,
    pub low_impact_mode: bool,
    pub background_processing: bool,
    pub throttling: ThrottlingConfig,
    pub caching: CachingConfig,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            adaptive: true,
            low_impact_mode: false,
            background_processing: true,
            throttling: ThrottlingConfig::default(),
            caching: CachingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThrottlingConfig {
    pub enabled: bool,
    pub max_concurrent: usize,
    #[serde(rename = "interval")]
    pub interval_ms: u64,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 4,
            interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CachingConfig {
    pub enabled: bool,
    #[serde(rename = "ttl")]
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 60_000,
            max_entries: 256,
        }
    }
}

/// Alert manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertingConfig {
    pub enabled: bool,
    pub throttling: AlertThrottlingConfig,
    pub escalation: EscalationConfig,
    pub suppression: SuppressionConfig,
    pub channels: Vec<ChannelConfig>,
    pub smart_filtering: SmartFilteringConfig,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            throttling: AlertThrottlingConfig::default(),
            escalation: EscalationConfig::default(),
            suppression: SuppressionConfig::default(),
            channels: vec![ChannelConfig::console()],
            smart_filtering: SmartFilteringConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertThrottlingConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_alerts_per_window: u32,
    pub batch_similar: bool,
}

impl Default for AlertThrottlingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            max_alerts_per_window: 10,
            batch_similar: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EscalationConfig {
    pub enabled: bool,
    pub timeouts: EscalationTimeouts,
    pub max_escalations: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeouts: EscalationTimeouts::default(),
            max_escalations: 2,
        }
    }
}

/// Per-level escalation timeouts in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EscalationTimeouts {
    pub warning: u64,
    pub error: u64,
    pub critical: u64,
}

impl Default for EscalationTimeouts {
    fn default() -> Self {
        Self {
            warning: 300_000,
            error: 120_000,
            critical: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SuppressionConfig {
    pub enabled: bool,
    #[serde(rename = "maxDuration")]
    pub max_duration_ms: u64,
    pub rules: Vec<SuppressionRule>,
}

impl Default for SuppressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_duration_ms: 3_600_000,
            rules: Vec::new(),
        }
    }
}

/// A suppression rule; all present fields must match (conjunctive).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SuppressionRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Case-insensitive substring matched against the alert message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Alert delivery channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Console,
    File,
    Webhook,
    Email,
}

/// A configured alert delivery channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    /// Minimum alert level this channel accepts; `None` accepts all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_level: Option<String>,
    #[serde(default)]
    pub filters: ChannelFilters,
    /// File path, webhook URL, or address depending on `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ChannelConfig {
    pub fn console() -> Self {
        Self {
            name: "console".into(),
            kind: ChannelKind::Console,
            min_level: None,
            filters: ChannelFilters::default(),
            target: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SmartFilteringConfig {
    pub enabled: bool,
    #[serde(rename = "duplicateWindow")]
    pub duplicate_window_ms: u64,
    pub similarity_threshold: f64,
}

impl Default for SmartFilteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duplicate_window_ms: 60_000,
            similarity_threshold: 0.85,
        }
    }
}

/// Event stream server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamingConfig {
    pub enabled: bool,
    pub port: u16,
    pub host: String,
    pub cors: bool,
    pub authentication: bool,
    pub compression: bool,
    pub max_connections: usize,
    pub buffer_size: usize,
    #[serde(rename = "heartbeatInterval")]
    pub heartbeat_interval_ms: u64,
    pub channels: Vec<String>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9323,
            host: "127.0.0.1".into(),
            cors: true,
            authentication: false,
            compression: false,
            max_connections: 64,
            buffer_size: 256,
            heartbeat_interval_ms: 15_000,
            channels: vec![
                "default".into(),
                "metrics".into(),
                "leaks".into(),
                "alerts".into(),
            ],
        }
    }
}

/// Hotspot analyzer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HotspotConfig {
    pub enabled: bool,
    #[serde(rename = "sampleInterval")]
    pub sample_interval_ms: u64,
    #[serde(rename = "retentionPeriod")]
    pub retention_period_ms: u64,
    pub hotspot_threshold: f64,
    /// Analysis categories toggled by name.
    pub categories: HashMap<String, bool>,
    pub thresholds: HotspotThresholds,
}

impl Default for HotspotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: 10_000,
            retention_period_ms: 600_000,
            hotspot_threshold: 0.8,
            categories: HashMap::new(),
            thresholds: HotspotThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HotspotThresholds {
    /// Relative growth over the retained window that raises a hotspot.
    pub growth: f64,
    /// Pattern occurrences within the window that raise a hotspot.
    pub frequency: u64,
    /// Minimum estimated object-type size in bytes to consider.
    pub size: u64,
}

impl Default for HotspotThresholds {
    fn default() -> Self {
        Self {
            growth: 0.15,
            frequency: 5,
            size: 1_048_576,
        }
    }
}

/// Supervisor error-handling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorHandlingConfig {
    pub exit_on_unhandled: bool,
    #[serde(rename = "gracefulShutdownTimeout")]
    pub graceful_shutdown_timeout_ms: u64,
    pub log_errors: bool,
    pub report_errors: bool,
    /// Total-error count that flips the heartbeat alarm.
    pub error_threshold: u64,
    #[serde(rename = "errorWindow")]
    pub error_window_ms: u64,
    pub circuit_breaker: BreakerSettings,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            exit_on_unhandled: false,
            graceful_shutdown_timeout_ms: 10_000,
            log_errors: true,
            report_errors: true,
            error_threshold: 50,
            error_window_ms: 300_000,
            circuit_breaker: BreakerSettings::default(),
        }
    }
}

/// Circuit breaker settings shared by supervised subsystems.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerSettings {
    pub threshold: u32,
    #[serde(rename = "window")]
    pub window_ms: u64,
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            window_ms: 60_000,
            timeout_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AgentConfig::default().validate().unwrap();
    }

    #[test]
    fn legacy_fields_fold_into_nested_form() {
        let config: AgentConfig = serde_json::from_value(serde_json::json!({
            "enabled": false,
            "interval": 12_000,
            "production": true
        }))
        .unwrap();
        let config = config.normalize();

        assert!(!config.detection.enabled);
        assert_eq!(config.monitoring.interval_ms, 12_000);
        assert!(config.enabled.is_none());
        assert!(config.interval.is_none());
        assert!(config.production.is_none());
    }

    #[test]
    fn legacy_interval_maps_onto_nested_field() {
        let config: AgentConfig = serde_json::from_value(serde_json::json!({
            "interval": 9_000,
            "monitoring": { "interval": 4_000 }
        }))
        .unwrap();
        // After normalization only monitoring.interval exists; code never
        // consults the flat field again.
        let config = config.normalize();
        assert_eq!(config.monitoring.interval_ms, 9_000);
        assert!(config.interval.is_none());
    }

    #[test]
    fn rejects_inverted_interval_bounds() {
        let mut config = AgentConfig::default();
        config.monitoring.min_interval_ms = 60_000;
        config.monitoring.max_interval_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let mut config = AgentConfig::default();
        config.threshold.heap = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sensitivity_thresholds() {
        assert_eq!(Sensitivity::Low.verdict_threshold(), 0.7);
        assert_eq!(Sensitivity::Medium.verdict_threshold(), 0.5);
        assert_eq!(Sensitivity::High.verdict_threshold(), 0.3);
    }
}
