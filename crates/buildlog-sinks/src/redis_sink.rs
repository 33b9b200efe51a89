use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, IntoConnectionInfo};
use tokio::sync::mpsc;
use tracing::{error, info};

use buildlog_types::{ContainerDescriptor, ContainerLabels};

use crate::{Sink, SinkAdapter, SinkError};

/// Root of every log key
const ROOT: &str = "build-logs";

/// Delay between connection attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Routing label value used when a container does not carry it
const UNKNOWN: &str = "unknown";

/// Redis connection settings
#[derive(Clone, Debug)]
pub struct RedisSinkConfig {
    /// Host or `redis://` URL
    pub url: Option<String>,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for RedisSinkConfig {
    fn default() -> Self {
        Self {
            url: None,
            password: None,
            db: 1,
        }
    }
}

impl RedisSinkConfig {
    fn client(&self) -> Result<redis::Client, SinkError> {
        let url = self
            .url
            .as_deref()
            .ok_or(SinkError::MissingConfig("redis url"))?;
        let url = if url.contains("://") {
            url.to_string()
        } else {
            format!("redis://{}", url)
        };

        let mut info = url.as_str().into_connection_info()?;
        info.redis.db = self.db;
        if let Some(password) = &self.password {
            info.redis.password = Some(password.clone());
        }
        Ok(redis::Client::open(info)?)
    }
}

/// Keys one container writes to
#[derive(Clone, Debug, PartialEq, Eq)]
struct RedisKeys {
    logs: String,
    last_update: String,
    metrics_prefix: String,
}

impl RedisKeys {
    fn for_container(labels: &ContainerLabels) -> Self {
        let account = labels.account_id().unwrap_or(UNKNOWN);
        let request = labels.request_id().unwrap_or(UNKNOWN);
        let step = labels.step_name().unwrap_or(UNKNOWN);

        Self {
            logs: format!("{ROOT}:{account}:{request}:steps:{step}:logs"),
            last_update: format!("{ROOT}:{account}:{request}:lastupdate"),
            metrics_prefix: format!("{account}:{request}:metrics"),
        }
    }

    fn metric(&self, path: &str) -> String {
        format!("{}:{}", self.metrics_prefix, path)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RedisCommand {
    Push { key: String, value: String },
    Set { key: String, value: String },
}

impl RedisCommand {
    async fn apply(self, connection: &mut ConnectionManager) -> Result<(), SinkError> {
        match self {
            Self::Push { key, value } => connection.rpush::<_, _, ()>(key, value).await?,
            Self::Set { key, value } => connection.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }
}

/// Sink writing log lines as Redis lists and metrics as plain keys
pub struct RedisSink {
    config: RedisSinkConfig,
    tx: mpsc::UnboundedSender<RedisCommand>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<RedisCommand>>>,
}

impl RedisSink {
    pub fn new(config: RedisSinkConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    async fn run_writer(client: redis::Client, mut rx: mpsc::UnboundedReceiver<RedisCommand>) {
        let mut connection = loop {
            match ConnectionManager::new(client.clone()).await {
                Ok(connection) => {
                    info!("Redis client ready");
                    break connection;
                }
                Err(e) => {
                    error!(error = %e, "Redis client error");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        };

        while let Some(command) = rx.recv().await {
            if let Err(e) = command.apply(&mut connection).await {
                error!(error = %e, "Redis write failed");
            }
        }
    }
}

#[async_trait]
impl Sink for RedisSink {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn validate(&self) -> Result<(), SinkError> {
        if self.config.url.as_deref().is_none_or(str::is_empty) {
            return Err(SinkError::MissingConfig("redis url"));
        }
        Ok(())
    }

    async fn start(&self) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };

        match self.config.client() {
            Ok(client) => {
                tokio::spawn(Self::run_writer(client, rx));
            }
            // Dropping the receiver makes every adapter call report the failure
            Err(e) => error!(error = %e, "Failed to create redis client"),
        }
    }

    fn attach(&self, container: &ContainerDescriptor) -> Arc<dyn SinkAdapter> {
        Arc::new(RedisAdapter {
            keys: RedisKeys::for_container(&container.labels),
            tx: self.tx.clone(),
        })
    }
}

struct RedisAdapter {
    keys: RedisKeys,
    tx: mpsc::UnboundedSender<RedisCommand>,
}

impl RedisAdapter {
    fn send(&self, command: RedisCommand) -> Result<(), SinkError> {
        self.tx.send(command).map_err(|_| SinkError::WriterClosed)
    }
}

impl SinkAdapter for RedisAdapter {
    fn push(&self, line: &str) -> Result<(), SinkError> {
        self.send(RedisCommand::Push {
            key: self.keys.logs.clone(),
            value: line.to_string(),
        })
    }

    fn set_last_update(&self, timestamp: DateTime<Utc>) -> Result<(), SinkError> {
        self.send(RedisCommand::Set {
            key: self.keys.last_update.clone(),
            value: timestamp.timestamp_millis().to_string(),
        })
    }

    fn update_metric(&self, path: &str, value: u64) -> Result<(), SinkError> {
        self.send(RedisCommand::Set {
            key: self.keys.metric(path),
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildlog_types::{ContainerStatus, labels};
    use chrono::TimeZone;

    fn descriptor() -> ContainerDescriptor {
        let container_labels: ContainerLabels = [
            (labels::ACCOUNT_ID, "acc"),
            (labels::REQUEST_ID, "req"),
            (labels::STEP_NAME, "build"),
        ]
        .into_iter()
        .collect();
        ContainerDescriptor::new("abc", ContainerStatus::Started, container_labels)
    }

    #[test]
    fn test_keys_for_container() {
        let keys = RedisKeys::for_container(&descriptor().labels);
        assert_eq!(keys.logs, "build-logs:acc:req:steps:build:logs");
        assert_eq!(keys.last_update, "build-logs:acc:req:lastupdate");
        assert_eq!(keys.metric("total"), "acc:req:metrics:total");
    }

    #[test]
    fn test_keys_with_missing_labels() {
        let keys = RedisKeys::for_container(&ContainerLabels::default());
        assert_eq!(keys.logs, "build-logs:unknown:unknown:steps:unknown:logs");
    }

    #[test]
    fn test_validate_requires_url() {
        assert!(matches!(
            RedisSink::new(RedisSinkConfig::default()).validate(),
            Err(SinkError::MissingConfig(_))
        ));

        let sink = RedisSink::new(RedisSinkConfig {
            url: Some("redis.local".into()),
            ..Default::default()
        });
        assert!(sink.validate().is_ok());
    }

    #[test]
    fn test_client_from_host() {
        let config = RedisSinkConfig {
            url: Some("redis.local:6380".into()),
            password: Some("secret".into()),
            db: 3,
        };
        assert!(config.client().is_ok());
    }

    #[tokio::test]
    async fn test_adapter_queues_commands_in_order() {
        let sink = RedisSink::new(RedisSinkConfig::default());
        let adapter = sink.attach(&descriptor());

        adapter.push("hello\n").unwrap();
        adapter
            .set_last_update(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap())
            .unwrap();
        adapter.update_metric("total", 6).unwrap();

        let mut rx = sink.rx.lock().take().unwrap();
        assert_eq!(
            rx.recv().await,
            Some(RedisCommand::Push {
                key: "build-logs:acc:req:steps:build:logs".into(),
                value: "hello\n".into(),
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(RedisCommand::Set {
                key: "build-logs:acc:req:lastupdate".into(),
                value: "1700000000000".into(),
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(RedisCommand::Set {
                key: "acc:req:metrics:total".into(),
                value: "6".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_adapter_reports_closed_writer() {
        let sink = RedisSink::new(RedisSinkConfig::default());
        // Missing URL: start cannot build a client and drops the queue
        sink.start().await;

        let adapter = sink.attach(&descriptor());
        assert!(matches!(adapter.push("x"), Err(SinkError::WriterClosed)));
    }
}
