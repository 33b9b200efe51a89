//! Container output capture for buildlog
//!
//! This crate provides the pieces that turn a container's output into
//! delivered log lines:
//! - Decoding of the runtime's multiplexed stdout/stderr framing
//! - Per-container capture sessions that acquire streams and emit records
//! - The byte budget shared by every session

mod budget;
mod demux;
mod session;

pub use budget::ByteBudget;
pub use demux::{FRAME_HEADER_LEN, MultiplexedCodec, decode_raw_chunk};
pub use session::{
    LIMIT_NOTICE, Session, SessionConfig, SessionError, SessionEvent, SessionState, SessionStream,
};

// Re-export types that are used in our public API
pub use buildlog_types::{LogRecord, LoggerStrategy};
