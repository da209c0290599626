//! # Core Engine Module
//!
//! The session-resilience and polling-orchestration engine.
//!
//! ## Core Components:
//!
//! - **`backoff`**: delay schedule for reconnect attempts.
//! - **`executor`**: the reconnect-aware call wrapper. Every device read goes
//!   through a `ResilientExecutor`, which hides transport loss behind an
//!   unbounded reconnect loop and an "unhealthy" flag.
//! - **`session_pool`**: the concurrent registry of logical sessions.
//! - **`aggregator`**: the multi-read snapshot with partial-failure tolerance.
//! - **`scheduler`**: per-session periodic polling and publishing.
//! - **`recovery`**: rebuilds sessions and pollers after a restart.
//! - **`service`**: the `GatewayService` facade exposing the session API.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Exponential backoff with jitter.
pub mod backoff;
/// Reconnect-aware wrapper around driver calls.
pub mod executor;
/// Registry of logical sessions.
pub mod session_pool;
/// One poll's worth of reads merged into a snapshot.
pub mod aggregator;
/// Per-session polling tasks.
pub mod scheduler;
/// Startup recovery from the store.
pub mod recovery;
/// The session API facade.
pub mod service;

// --- Public API Re-exports ---
pub use aggregator::{Aggregator, AxisInfo, CurrentProgram, PollProfile, ProgramInfo, SpindleInfo, Snapshot, StatusView};
pub use backoff::BackoffPolicy;
pub use executor::{LinkSettings, LinkState, ResilientExecutor};
pub use recovery::{recover, RecoveryReport};
pub use scheduler::{PollSettings, PollingScheduler};
pub use service::{GatewayService, GatewaySettings};
pub use session_pool::{ConnectionCheck, PollControl, PoolSettings, SessionInfo, SessionLink, SessionPool};
