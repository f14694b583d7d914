//! Event stream server for the heapwatch agent
//!
//! Fans sampled data, leak verdicts, and alerts out to remote
//! subscribers over a long-lived HTTP push channel with per-subscriber
//! channel lists and filter predicates.

pub mod hub;
pub mod server;

pub use hub::{ChannelInfo, HubStats, StreamEvent, StreamFilter, StreamHub};
pub use server::{StreamAuthenticator, StreamServer};
