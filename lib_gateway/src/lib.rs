//! # lib_gateway
//!
//! Session-resilience and polling engine for FANUC controllers reachable over
//! the FOCAS Ethernet transport.
//!
//! ## Contained Modules
//!
//! - **`driver`**: The opaque device boundary (`DeviceDriver`), vendor status
//!   codes, the one-shot process-wide startup, and an in-process simulator.
//! - **`models`**: Model-family resolution from the reported series string and
//!   the per-family state interpreter and program reader.
//! - **`core`**: The reconnect-aware call executor, the session pool, the
//!   snapshot aggregator, the polling scheduler, startup recovery and the
//!   `GatewayService` facade tying them together.
//! - **`connections`**: Persistence and publish contracts with in-memory,
//!   PostgreSQL (`connections` feature) and Redis (`connections` feature)
//!   implementations.
//! - **`loggers`** (`loggers` feature): tracing subscriber bootstrap.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod connections;
pub mod core;
pub mod driver;
pub mod error;
pub mod models;

#[cfg(feature = "loggers")]
pub mod loggers;

pub use crate::core::{
    Aggregator, BackoffPolicy, GatewayService, GatewaySettings, PollProfile, PollingScheduler,
    ResilientExecutor, SessionInfo, SessionPool, Snapshot, StatusView,
};
pub use crate::driver::{DeviceDriver, DriverError, DriverRuntime, Endpoint, Handle};
pub use crate::error::{GatewayError, GatewayResult};
pub use crate::models::{resolve, ModelFamily, ModelStrategy};
