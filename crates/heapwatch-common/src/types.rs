//! Shared data model for the heapwatch agent
//!
//! Everything that crosses a subsystem boundary or the wire lives here:
//! samples, baselines, verdicts, hotspots, alerts, and the agent event
//! envelope.

use crate::error::ErrorRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A single point-in-time observation of runtime memory and activity.
///
/// Samples are immutable once produced by the probe; consumers receive
/// clones and never mutate them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub heap: HeapStats,
    /// GC events observed since the previous sample, in arrival order.
    pub gc: Vec<GcEvent>,
    /// Measured event-loop (scheduler) latency overshoot in milliseconds.
    pub event_loop_delay_ms: f64,
    pub cpu: CpuStats,
    pub os: OsStats,
}

impl Sample {
    /// Check the heap ordering invariant `used <= total <= limit`.
    pub fn heap_invariant_holds(&self) -> bool {
        self.heap.used <= self.heap.total && self.heap.total <= self.heap.limit
    }
}

/// Heap and allocator counters at sampling time, in bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeapStats {
    pub used: u64,
    pub total: u64,
    pub limit: u64,
    pub available: u64,
    pub physical: u64,
    pub malloced: u64,
    pub peak_malloced: u64,
    pub external: u64,
    pub array_buffers: u64,
    pub spaces: Vec<HeapSpace>,
}

/// A named allocator space within the heap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapSpace {
    pub name: String,
    pub size: u64,
    pub used: u64,
    pub available: u64,
    pub physical: u64,
}

/// A single garbage-collection notification from the host runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcEvent {
    pub kind: GcKind,
    pub duration_ms: f64,
    pub flags: u32,
}

/// Collection kinds recognized from the runtime's GC notification facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcKind {
    Scavenge,
    MarkSweepCompact,
    IncrementalMarking,
    WeakProcessing,
    All,
    Unknown,
}

/// Process CPU usage at sampling time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuStats {
    pub user_ms: f64,
    pub system_ms: f64,
    pub percent: f32,
}

/// Host OS counters at sampling time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsStats {
    pub platform: String,
    pub total_mem: u64,
    pub free_mem: u64,
    pub cpus: usize,
    pub load_avg: [f64; 3],
    pub uptime_secs: u64,
}

/// Statistical reference established over the initial observation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub avg_heap_size: f64,
    pub std_dev_heap_size: f64,
    pub avg_gc_frequency: f64,
    pub samples_used: usize,
    pub established_at: DateTime<Utc>,
}

/// Leak classification emitted by the detector for a single sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakVerdict {
    /// Accumulated leak probability in `[0, 1]`.
    pub probability: f64,
    /// Names of the pattern detectors that fired.
    pub factors: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub metrics: VerdictMetrics,
    pub recommendations: Vec<String>,
}

/// Heap counters captured alongside a verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VerdictMetrics {
    pub heap_used: u64,
    pub heap_total: u64,
    pub heap_limit: u64,
}

/// Severity bands shared by hotspots and analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Hotspot classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HotspotKind {
    MemoryGrowth,
    ObjectGrowth,
    HeapSpacePressure,
    AllocationPattern,
}

/// A persistent, classified pressure signal derived from repeated
/// observations. Identity is the `id`, derived from kind + subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hotspot {
    pub id: String,
    pub kind: HotspotKind,
    pub severity: Severity,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: u64,
    /// Kind-specific measurements (growth rate, space name, pattern key).
    pub details: serde_json::Value,
    pub recommendations: Vec<String>,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Alert severity bands, ordered for escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    /// Numeric rank used in severity computation and channel filtering.
    pub fn priority(self) -> u32 {
        match self {
            AlertLevel::Info => 1,
            AlertLevel::Warning => 2,
            AlertLevel::Error => 3,
            AlertLevel::Critical => 4,
        }
    }

    /// The next band up; escalation never goes beyond `Critical`.
    pub fn escalated(self) -> AlertLevel {
        match self {
            AlertLevel::Info => AlertLevel::Warning,
            AlertLevel::Warning => AlertLevel::Error,
            AlertLevel::Error | AlertLevel::Critical => AlertLevel::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

/// Heap metrics attached to an alert for message enhancement and
/// severity bonuses.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AlertMetrics {
    pub heap_used: u64,
    pub heap_total: u64,
    pub heap_limit: u64,
    /// Heap growth rate in bytes per minute, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub growth_rate: Option<f64>,
    /// GC events per minute, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gc_frequency: Option<f64>,
}

/// A normalized, deduplicated alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    /// Stable dedup key over `(level, source, category, title)`.
    pub fingerprint: String,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhanced_message: Option<String>,
    pub source: String,
    pub category: String,
    pub tags: Vec<String>,
    /// Integer rank: `level priority * (1 + pressure bonuses)`.
    pub severity: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<AlertMetrics>,
    pub recommendations: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub escalated: bool,
    pub escalation_count: u32,
}

/// Snapshot of the agent's health collected by the supervisor heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub running: bool,
    /// Per-subsystem state descriptions.
    pub subsystems: HashMap<String, String>,
    /// Per-breaker state names.
    pub breakers: HashMap<String, String>,
    pub total_errors: u64,
    /// Set when `total_errors` crossed the configured alarm threshold.
    pub error_alarm: bool,
}

/// Event envelope fanned out to hosts and stream subscribers.
///
/// Serialized variant names are the public event names; they are part of
/// the wire contract.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum AgentEvent {
    Metrics(Box<Sample>),
    Leak(LeakVerdict),
    Warning(LeakVerdict),
    BaselineEstablished(Baseline),
    HotspotDetected(Hotspot),
    HotspotExpired { id: String },
    HotspotResolved { id: String, resolution: String },
    AlertCreated(Alert),
    AlertEscalated(Alert),
    AlertResolved { id: Uuid, resolution: String },
    AlertSuppressed { id: Uuid, until: DateTime<Utc> },
    AlertThrottled { fingerprint: String },
    AlertMaxEscalation { id: Uuid },
    NotificationError { channel: String, error: String },
    IntervalOptimized { previous_ms: u64, current_ms: u64 },
    SamplingOptimized { previous: f64, current: f64 },
    OperationsDropped { count: usize },
    StreamingStarted { addr: String },
    StreamingStopped,
    StreamingClientConnected { id: Uuid },
    StreamingClientDisconnected { id: Uuid },
    HealthCheck(HealthReport),
    Error(ErrorRecord),
    CriticalError(ErrorRecord),
    Shutdown,
}

impl AgentEvent {
    /// The public event name, matching the serialized `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Metrics(_) => "metrics",
            AgentEvent::Leak(_) => "leak",
            AgentEvent::Warning(_) => "warning",
            AgentEvent::BaselineEstablished(_) => "baseline-established",
            AgentEvent::HotspotDetected(_) => "hotspot-detected",
            AgentEvent::HotspotExpired { .. } => "hotspot-expired",
            AgentEvent::HotspotResolved { .. } => "hotspot-resolved",
            AgentEvent::AlertCreated(_) => "alert-created",
            AgentEvent::AlertEscalated(_) => "alert-escalated",
            AgentEvent::AlertResolved { .. } => "alert-resolved",
            AgentEvent::AlertSuppressed { .. } => "alert-suppressed",
            AgentEvent::AlertThrottled { .. } => "alert-throttled",
            AgentEvent::AlertMaxEscalation { .. } => "alert-max-escalation",
            AgentEvent::NotificationError { .. } => "notification-error",
            AgentEvent::IntervalOptimized { .. } => "interval-optimized",
            AgentEvent::SamplingOptimized { .. } => "sampling-optimized",
            AgentEvent::OperationsDropped { .. } => "operations-dropped",
            AgentEvent::StreamingStarted { .. } => "streaming-started",
            AgentEvent::StreamingStopped => "streaming-stopped",
            AgentEvent::StreamingClientConnected { .. } => "streaming-client-connected",
            AgentEvent::StreamingClientDisconnected { .. } => "streaming-client-disconnected",
            AgentEvent::HealthCheck(_) => "health-check",
            AgentEvent::Error(_) => "error",
            AgentEvent::CriticalError(_) => "critical-error",
            AgentEvent::Shutdown => "shutdown",
        }
    }
}
