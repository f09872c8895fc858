//! # Channel Statistics Module
//!
//! Tracks per-channel message counters for the broadcaster: how many messages
//! were sent to and received from each MQTT topic, and when the channel was
//! last active. A channel counts as online while its last activity falls
//! inside a configurable freshness window.
//!
//! ## Module Architecture
//!
//! ```text
//! stats/
//! └── store.rs - StatsStore, ChannelStats, JSON persistence
//! ```
//!
//! The store is shared between the broadcast workers (sent counters), the
//! dispatcher consuming broker events (received counters), and the
//! presentation layer (snapshots). Increments go through a single mutex so
//! concurrent updates from any number of tasks never lose counts.
//!
//! ## Persistence
//!
//! Counters survive restarts as a JSON mapping from channel name to counters.
//! A missing or corrupt file degrades to an empty store with a logged warning
//! instead of failing startup.

pub mod store;

pub use store::{ChannelStats, StatsError, StatsStore};
