//! Log sinks for buildlog
//!
//! This crate provides the backends captured log lines are written to: a Redis
//! key/value sink, a Firebase realtime-database sink, and a composite that fans
//! the same calls out to several of them.

mod composite;
mod error;
mod factory;
mod firebase_sink;
mod redis_sink;
mod sink;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use composite::CompositeSink;
pub use error::SinkError;
pub use factory::{SinkKind, SinkSettings, build_sink};
pub use firebase_sink::{FirebaseSink, FirebaseSinkConfig};
pub use redis_sink::{RedisSink, RedisSinkConfig};
pub use sink::{Sink, SinkAdapter};
