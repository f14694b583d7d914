//! Shared types and utilities for the heapwatch agent
//!
//! This crate provides the data model, configuration surface, error
//! taxonomy, and resilience primitives used across all components of the
//! heapwatch memory-observability agent.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod retry;
pub mod ring;
pub mod timer;
pub mod types;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use config::{AgentConfig, Sensitivity};
pub use error::{Error, ErrorRecord, Result};
pub use retry::{RetryConfig, RetryManager};
pub use ring::MetricRing;
pub use timer::SafeTimer;
pub use types::*;
