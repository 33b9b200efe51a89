use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use buildlog_types::{ContainerDescriptor, labels};

use crate::{Sink, SinkAdapter, SinkError};

/// Firebase realtime-database settings
#[derive(Clone, Debug, Default)]
pub struct FirebaseSinkConfig {
    /// Database root the daemon authenticates against
    pub base_url: Option<String>,
    /// Database secret sent as the `auth` query parameter
    pub secret: Option<String>,
    /// Metrics location used when a container has no metrics label
    pub metrics_logs_url: Option<String>,
    /// Upper bound for one REST call, connect included
    pub request_timeout: Option<Duration>,
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A single REST write
#[derive(Debug, PartialEq)]
struct FirebaseWrite {
    method: Method,
    url: String,
    body: Value,
}

/// REST endpoint for a database location
fn location_url(location: &str) -> String {
    format!("{}.json", location.trim_end_matches('/'))
}

#[derive(Clone)]
struct FirebaseWriter {
    client: reqwest::Client,
    secret: String,
    timeout: Duration,
}

impl FirebaseWriter {
    async fn send(&self, write: FirebaseWrite) -> Result<(), SinkError> {
        self.client
            .request(write.method, location_url(&write.url))
            .query(&[("auth", self.secret.as_str())])
            .timeout(self.timeout)
            .json(&write.body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Check that the database answers with the configured credentials
    async fn check_connection(&self, base_url: &str) -> Result<(), SinkError> {
        self.client
            .get(format!("{}/.json", base_url.trim_end_matches('/')))
            .query(&[("auth", self.secret.as_str()), ("shallow", "true")])
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn run(self, base_url: Option<String>, mut rx: mpsc::UnboundedReceiver<FirebaseWrite>) {
        if let Some(base_url) = base_url {
            match self.check_connection(&base_url).await {
                Ok(()) => info!("Firebase connection verified"),
                Err(e) => error!(error = %e, "Firebase connection check failed"),
            }
        }

        while let Some(write) = rx.recv().await {
            let url = write.url.clone();
            if let Err(e) = self.send(write).await {
                error!(url = %url, error = %e, "Firebase write failed");
            }
        }
    }
}

/// Sink writing through the Firebase realtime-database REST API
pub struct FirebaseSink {
    config: FirebaseSinkConfig,
    client: reqwest::Client,
    tx: mpsc::UnboundedSender<FirebaseWrite>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<FirebaseWrite>>>,
}

impl FirebaseSink {
    pub fn new(config: FirebaseSinkConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            client: reqwest::Client::new(),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl Sink for FirebaseSink {
    fn name(&self) -> &'static str {
        "firebase"
    }

    fn validate(&self) -> Result<(), SinkError> {
        if self.config.base_url.as_deref().is_none_or(str::is_empty) {
            return Err(SinkError::MissingConfig("firebase auth url"));
        }
        if self.config.secret.as_deref().is_none_or(str::is_empty) {
            return Err(SinkError::MissingConfig("firebase secret"));
        }
        Ok(())
    }

    async fn start(&self) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };

        let writer = FirebaseWriter {
            client: self.client.clone(),
            secret: self.config.secret.clone().unwrap_or_default(),
            timeout: self
                .config
                .request_timeout
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        };
        tokio::spawn(writer.run(self.config.base_url.clone(), rx));
    }

    fn attach(&self, container: &ContainerDescriptor) -> Arc<dyn SinkAdapter> {
        let container_labels = &container.labels;
        let logs_url = container_labels
            .get(labels::FIREBASE_LOGS_URL)
            .map(str::to_string);
        if logs_url.is_none() {
            warn!(
                container_id = container.id.as_deref().unwrap_or_default(),
                "Container has no firebase logs location; lines will not be stored"
            );
        }

        Arc::new(FirebaseAdapter {
            logs_url,
            last_update_url: container_labels
                .get(labels::FIREBASE_LAST_UPDATE_URL)
                .map(str::to_string),
            metrics_url: container_labels
                .get(labels::FIREBASE_METRICS_LOGS_URL)
                .map(str::to_string)
                .or_else(|| self.config.metrics_logs_url.clone()),
            tx: self.tx.clone(),
        })
    }
}

struct FirebaseAdapter {
    logs_url: Option<String>,
    last_update_url: Option<String>,
    metrics_url: Option<String>,
    tx: mpsc::UnboundedSender<FirebaseWrite>,
}

impl FirebaseAdapter {
    fn send(&self, method: Method, url: Option<String>, body: Value) -> Result<(), SinkError> {
        let Some(url) = url else {
            return Ok(());
        };
        self.tx
            .send(FirebaseWrite { method, url, body })
            .map_err(|_| SinkError::WriterClosed)
    }
}

impl SinkAdapter for FirebaseAdapter {
    fn push(&self, line: &str) -> Result<(), SinkError> {
        self.send(Method::POST, self.logs_url.clone(), Value::from(line))
    }

    fn set_last_update(&self, timestamp: DateTime<Utc>) -> Result<(), SinkError> {
        self.send(
            Method::PUT,
            self.last_update_url.clone(),
            Value::from(timestamp.timestamp_millis()),
        )
    }

    fn update_metric(&self, path: &str, value: u64) -> Result<(), SinkError> {
        let url = self
            .metrics_url
            .as_deref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), path));
        self.send(Method::PUT, url, Value::from(value))
    }
}
