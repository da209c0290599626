//! # Connections Module
//!
//! Contracts and adapters for the two external collaborators of the engine:
//! the persistence gateway holding session and poll state, and the publish
//! sink receiving serialized snapshots.

/// Machine record, repository contract and its error type.
pub mod repository;
/// In-memory repository for tests and database-less deployments.
pub mod memory_store;
/// Publish sink contract with channel and log-only implementations.
pub mod sink;

/// PostgreSQL-backed repository using a deadpool connection pool.
#[cfg(feature = "connections")]
pub mod db_postgres;

/// Redis stream sink.
#[cfg(feature = "connections")]
pub mod cache_redis;

pub use memory_store::InMemoryRepository;
pub use repository::{MachineRecord, MachineRepository, PollStatus, RepositoryError};
pub use sink::{ChannelSink, LogSink, PublishSink, SinkError};

#[cfg(feature = "connections")]
pub use cache_redis::RedisSink;
#[cfg(feature = "connections")]
pub use db_postgres::PostgresRepository;
