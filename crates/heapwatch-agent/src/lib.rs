//! heapwatch: an in-process memory-observability agent
//!
//! Samples the host process's runtime (heap, allocator, GC activity,
//! scheduler latency, OS counters), classifies the series against leak
//! patterns, tracks pressure hotspots, raises deduplicated alerts, and
//! optionally pushes a live event stream to remote subscribers.
//!
//! ```ignore
//! use heapwatch_agent::{AgentConfig, HeapwatchAgent};
//!
//! #[tokio::main]
//! async fn main() -> heapwatch_agent::Result<()> {
//!     let agent = HeapwatchAgent::new(AgentConfig::default())?;
//!     let mut events = agent.subscribe();
//!     agent.start().await?;
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", event.name());
//!     }
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod snapshot;
mod supervisor;

pub use agent::{HeapwatchAgent, MetricsReport, PerformanceReport, ProfileReport};
pub use snapshot::{AnalyzeOptions, InMemorySnapshotProvider, SnapshotHandle, SnapshotProvider};

pub use heapwatch_alerts::{AlertFilter, AlertInput, AlertStats};
pub use heapwatch_common::config::{AgentConfig, StreamingConfig};
pub use heapwatch_common::{
    AgentEvent, Alert, AlertLevel, Baseline, Error, ErrorRecord, GcEvent, GcKind, HealthReport,
    Hotspot, LeakVerdict, Result, Sample, Severity,
};
pub use heapwatch_detect::{HotspotFilter, HotspotStats};
pub use heapwatch_perf::{OperationOptions, PutOptions};
pub use heapwatch_probe::{CountingAllocator, GcHooks, GcRecorder};
pub use heapwatch_stream::{StreamAuthenticator, StreamFilter};

/// Initialize a tracing subscriber honoring `RUST_LOG`; call once from
/// the embedding binary.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
