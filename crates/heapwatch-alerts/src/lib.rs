//! Alert management for the heapwatch agent
//!
//! Normalizes detector verdicts, hotspots, and host-submitted signals
//! into deduplicated alerts with sliding-window throttling, scheduled
//! escalation, rule-based suppression, and channel routing.

pub mod manager;
pub mod sinks;

pub use manager::{
    compute_severity, fingerprint, AlertFilter, AlertInput, AlertManager, AlertStats,
};
pub use sinks::{AlertSink, ConsoleSink, EmailSink, FileSink, WebhookSink};
