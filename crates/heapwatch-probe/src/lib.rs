//! Runtime memory probe for the heapwatch agent
//!
//! Best-effort mapping from the process's introspection facilities (OS
//! counters, allocator gauge, host-reported GC notifications, scheduler
//! latency) to the shared [`heapwatch_common::Sample`] shape.

pub mod gc;
pub mod heap_gauge;
pub mod history;
pub mod loop_delay;
pub mod probe;

pub use gc::{gc_channel, GcEventDrain, GcHooks, GcRecorder, NoGcRuntime};
pub use heap_gauge::{CountingAllocator, GaugeSnapshot, HeapGauge};
pub use history::{SampleHistory, DEFAULT_GC_EVENTS, DEFAULT_HEAP_SAMPLES, DEFAULT_LOOP_SAMPLES};
pub use loop_delay::LoopDelayMonitor;
pub use probe::{ProbeConfig, RuntimeProbe};
