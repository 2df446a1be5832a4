//! Replica Interest Library
//!
//! Decides which peers receive updates for which replicas, and which
//! changed values are worth sending at all.
//!
//! # Modules
//!
//! - `interest` - rules, attributes, handler slots and the matching pass
//! - `throttle` - change-significance filters with sent-value baselines
//! - `replication` - per-peer send plans from interest results and throttles
//! - `protocol` - wire messages for remote rule management
//!
//! # Features
//!
//! - `parallel` - run dirty handler slots on the rayon pool (enabled by default)

pub mod config;
pub mod util;
pub mod interest;
pub mod throttle;
pub mod replication;
pub mod protocol;
pub mod metrics;
