use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use buildlog_docker::{ContainerRuntime, EventStream, RuntimeError};
use buildlog_logs::{ByteBudget, Session, SessionConfig, SessionEvent};
use buildlog_sinks::{Sink, SinkAdapter};
use buildlog_types::{
    ContainerDescriptor, ContainerHandlingStatus, ContainerStatus, DaemonStatus, LoggerStrategy,
};

use crate::{RouterError, RoutingState, StateFile};

/// Metric the budget total is published under
const TOTAL_METRIC: &str = "total";

/// Router settings
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Identifier containers must carry to be captured by this daemon
    pub logger_id: Option<String>,
    /// Capture containers that were already running at startup
    pub listen_on_existing: bool,
    /// Global byte ceiling across all sessions
    pub log_size_limit: Option<u64>,
    /// Where the routing state is persisted
    pub state_file: Option<PathBuf>,
    /// Delay before subscribing again to a lost event feed
    pub resubscribe_delay: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            logger_id: None,
            listen_on_existing: false,
            log_size_limit: None,
            state_file: None,
            resubscribe_delay: Duration::from_secs(5),
        }
    }
}

/// Outcome of presenting a container to the router
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// A session was created and is starting
    Admitted,
    /// The descriptor has no container id
    MissingId,
    /// The container is already handled
    Duplicate,
    /// The descriptor has no lifecycle status
    MissingStatus,
    /// The container belongs to another logger
    ForeignLogger,
    /// The container has no strategy label
    MissingStrategy,
    /// The strategy label holds an unknown value
    UnsupportedStrategy(String),
    /// The logs strategy waits for the container to start
    AwaitingStart,
}

struct Route {
    session: Arc<Session>,
    adapter: Arc<dyn SinkAdapter>,
}

enum Step {
    Shutdown,
    Feed(Option<Result<ContainerDescriptor, RuntimeError>>),
    Session(SessionEvent),
    Resubscribe,
}

/// Admits build containers and owns their capture sessions
pub struct Router {
    config: RouterConfig,
    runtime: Arc<dyn ContainerRuntime>,
    sink: Box<dyn Sink>,
    budget: Arc<ByteBudget>,
    state: RoutingState,
    state_file: Option<StateFile>,
    routes: HashMap<String, Route>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    feed: Option<EventStream>,
    resubscribe_at: Option<Instant>,
}

impl Router {
    pub fn new(config: RouterConfig, runtime: Arc<dyn ContainerRuntime>, sink: Box<dyn Sink>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            budget: Arc::new(ByteBudget::new(config.log_size_limit)),
            state_file: config.state_file.clone().map(StateFile::new),
            config,
            runtime,
            sink,
            state: RoutingState::new(),
            routes: HashMap::new(),
            events_tx,
            events_rx,
            feed: None,
            resubscribe_at: None,
        }
    }

    pub fn state(&self) -> &RoutingState {
        &self.state
    }

    pub fn budget(&self) -> &Arc<ByteBudget> {
        &self.budget
    }

    pub fn session(&self, container_id: &str) -> Option<&Arc<Session>> {
        self.routes.get(container_id).map(|route| &route.session)
    }

    pub fn session_count(&self) -> usize {
        self.routes.len()
    }

    /// Check configuration before anything is started
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.config.logger_id.as_deref().is_none_or(str::is_empty) {
            return Err(RouterError::MissingLoggerId);
        }
        self.sink.validate()?;
        Ok(())
    }

    /// Start the sink, subscribe to container events and optionally pick up
    /// containers that are already running.
    ///
    /// A failed subscription is retried by [`Router::run`].
    pub async fn start(&mut self) {
        self.sink.start().await;
        self.subscribe().await;

        self.state.set_status(DaemonStatus::Ready);
        self.persist();
        info!(
            logger_id = self.config.logger_id.as_deref().unwrap_or_default(),
            sink = self.sink.name(),
            "Listening for container events"
        );

        if self.config.listen_on_existing {
            self.backfill().await;
        }
    }

    async fn subscribe(&mut self) -> bool {
        match self.runtime.events().await {
            Ok(feed) => {
                self.feed = Some(feed);
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to subscribe to container events");
                false
            }
        }
    }

    async fn backfill(&mut self) {
        match self.runtime.list_containers().await {
            Ok(containers) => {
                info!(count = containers.len(), "Checking running containers");
                for container in containers {
                    self.handle_container(container);
                }
            }
            Err(e) => error!(error = %e, "Failed to list running containers"),
        }
    }

    /// Process container events and session notifications until `shutdown`
    /// fires
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), RouterError> {
        loop {
            let step = match self.feed.as_mut() {
                Some(feed) => tokio::select! {
                    _ = shutdown.cancelled() => Step::Shutdown,
                    event = feed.next() => Step::Feed(event),
                    Some(event) = self.events_rx.recv() => Step::Session(event),
                },
                None => {
                    let deadline = *self
                        .resubscribe_at
                        .get_or_insert_with(|| Instant::now() + self.config.resubscribe_delay);
                    tokio::select! {
                        _ = shutdown.cancelled() => Step::Shutdown,
                        _ = tokio::time::sleep_until(deadline) => Step::Resubscribe,
                        Some(event) = self.events_rx.recv() => Step::Session(event),
                    }
                }
            };

            match step {
                Step::Shutdown => break,
                Step::Feed(Some(Ok(container))) => {
                    self.handle_container(container);
                }
                Step::Feed(Some(Err(e))) => {
                    error!(error = %e, "Container event feed failed");
                    self.feed = None;
                }
                Step::Feed(None) => {
                    warn!("Container event feed ended");
                    self.feed = None;
                }
                Step::Session(event) => self.handle_session_event(event),
                Step::Resubscribe => self.resubscribe().await,
            }
        }

        info!(sessions = self.routes.len(), "Shutting down");
        for route in self.routes.values() {
            route.session.stop();
        }
        Ok(())
    }

    async fn resubscribe(&mut self) {
        self.resubscribe_at = None;
        if !self.subscribe().await {
            return;
        }
        info!("Subscribed to container events again");

        // containers created while the feed was down
        if self.config.listen_on_existing {
            self.backfill().await;
        }
    }

    /// Decide whether to capture a container, and start a session if so
    pub fn handle_container(&mut self, container: ContainerDescriptor) -> Admission {
        let Some(container_id) = container.id.clone() else {
            error!("Container event without an id");
            return Admission::MissingId;
        };

        if self.state.contains(&container_id) {
            debug!(container_id = %container_id, "Container already handled");
            return Admission::Duplicate;
        }

        let Some(status) = container.status.clone() else {
            debug!(container_id = %container_id, "Container event without a status");
            return Admission::MissingStatus;
        };

        if container.labels.logger_id() != self.config.logger_id.as_deref() {
            debug!(container_id = %container_id, "Container belongs to another logger");
            return Admission::ForeignLogger;
        }

        let Some(strategy) = container.labels.strategy() else {
            error!(container_id = %container_id, "Container has no logger strategy");
            return Admission::MissingStrategy;
        };
        let strategy: LoggerStrategy = match strategy.parse() {
            Ok(strategy) => strategy,
            Err(e) => {
                error!(container_id = %container_id, error = %e, "Unsupported logger strategy");
                return Admission::UnsupportedStrategy(strategy.to_string());
            }
        };

        if status == ContainerStatus::Created && strategy == LoggerStrategy::Logs {
            debug!(container_id = %container_id, "Waiting for container to start");
            return Admission::AwaitingStart;
        }

        self.state
            .set_container(&container_id, ContainerHandlingStatus::Initializing);
        self.persist();

        let adapter = self.sink.attach(&container);
        let session = Arc::new(Session::new(
            SessionConfig {
                container_id: container_id.clone(),
                strategy,
                log_size_limit: container.labels.log_size_limit(),
            },
            self.runtime.clone(),
            adapter.clone(),
            self.budget.clone(),
            self.events_tx.clone(),
        ));
        session.spawn();

        info!(
            container_id = %container_id,
            strategy = %strategy,
            status = %status,
            "Capturing container"
        );
        self.routes
            .insert(container_id, Route { session, adapter });
        Admission::Admitted
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Started { container_id } => {
                self.state
                    .set_container(&container_id, ContainerHandlingStatus::Listening);
                self.persist();
                debug!(container_id = %container_id, "Container listening");
            }
            SessionEvent::Failed {
                container_id,
                error,
            } => {
                error!(container_id = %container_id, error = %error, "Failed to capture container");
            }
            SessionEvent::LogSizeChanged { container_id, .. } => {
                let Some(route) = self.routes.get(&container_id) else {
                    return;
                };
                let total = self.budget.total();
                if let Err(e) = route.adapter.update_metric(TOTAL_METRIC, total) {
                    warn!(container_id = %container_id, error = %e, "Failed to update total log size");
                }
            }
            SessionEvent::StreamEnded {
                container_id,
                stream,
            } => {
                debug!(container_id = %container_id, stream = %stream, "Session stream ended");
            }
        }
    }

    fn persist(&self) {
        let Some(file) = &self.state_file else {
            return;
        };
        if let Err(e) = file.write(&self.state) {
            error!(
                path = %file.path().display(),
                error = %e,
                "Failed to write state file"
            );
        }
    }
}
