//! Performance optimization for the heapwatch agent
//!
//! Keeps the agent itself low-overhead: adaptive sampling interval and
//! rate, a bounded priority-queued operation executor, and a TTL cache
//! with priority eviction.

pub mod cache;
pub mod optimizer;
pub mod queue;

pub use cache::{CacheConfig, CacheStats, OptimizerCache, PutOptions};
pub use optimizer::{
    OptimizerConfig, OverheadReport, PerformanceOptimizer, ResourceSnapshot, SamplingStrategy,
};
pub use queue::{OperationOptions, OperationQueue, QueueStats};
