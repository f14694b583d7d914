//! Leak detection and hotspot analysis for the heapwatch agent
//!
//! This crate classifies sampled memory series against leak patterns and
//! tracks recurring pressure hotspots over a retained window.

pub mod detector;
pub mod hotspots;
pub mod regression;

pub use detector::{DetectorConfig, LeakDetector, Observation, VerdictKind};
pub use hotspots::{HotspotAnalyzer, HotspotEvent, HotspotFilter, HotspotStats};
pub use regression::{linear_regression, mean, std_dev, Regression};
