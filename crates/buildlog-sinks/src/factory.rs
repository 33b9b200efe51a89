use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::{
    CompositeSink, FirebaseSink, FirebaseSinkConfig, RedisSink, RedisSinkConfig, Sink, SinkError,
};

/// Supported sink backends
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkKind {
    Firebase,
    Redis,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Firebase => "firebase",
            Self::Redis => "redis",
        }
    }

    /// Parse a comma separated list such as `firebase,redis`
    pub fn parse_list(value: &str) -> Result<Vec<Self>, SinkError> {
        let mut kinds = Vec::new();
        for kind in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let kind = kind.parse()?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SinkKind {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "firebase" => Ok(Self::Firebase),
            "redis" => Ok(Self::Redis),
            _ => Err(SinkError::UnknownKind(s.to_string())),
        }
    }
}

/// Everything needed to build the configured sinks
#[derive(Clone, Debug, Default)]
pub struct SinkSettings {
    pub kinds: Vec<SinkKind>,
    pub firebase: FirebaseSinkConfig,
    pub redis: RedisSinkConfig,
}

/// Build the sink for the configured kinds.
///
/// A single kind yields that sink directly, several are wrapped in a
/// [`CompositeSink`].
pub fn build_sink(settings: &SinkSettings) -> Result<Box<dyn Sink>, SinkError> {
    let mut sinks: Vec<Box<dyn Sink>> = settings
        .kinds
        .iter()
        .map(|kind| -> Box<dyn Sink> {
            match kind {
                SinkKind::Firebase => Box::new(FirebaseSink::new(settings.firebase.clone())),
                SinkKind::Redis => Box::new(RedisSink::new(settings.redis.clone())),
            }
        })
        .collect();

    info!(
        sinks = ?settings.kinds.iter().map(SinkKind::as_str).collect::<Vec<_>>(),
        "Configured log sinks"
    );

    match sinks.len() {
        0 => Err(SinkError::NoSinks),
        1 => Ok(sinks.remove(0)),
        _ => Ok(Box::new(CompositeSink::new(sinks))),
    }
}
